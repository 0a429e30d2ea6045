pub mod formatter;

pub use formatter::{
    format_breakdown, format_contribution, format_leaderboard_json, format_leaderboard_table,
    format_leaderboard_tsv, format_my_rank, format_points, should_use_colors,
};
