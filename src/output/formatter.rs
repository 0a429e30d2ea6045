use std::io::IsTerminal;
use owo_colors::OwoColorize;
use terminal_size::{Width, terminal_size};

use crate::activity::Category;
use crate::leaderboard::{LeaderboardEntry, LeaderboardPage, MyRank, Scope};
use crate::scoring::{BadgeProgress, UserContribution};

/// Check if stdout is a TTY (for auto-detecting color support)
pub fn should_use_colors() -> bool {
    std::io::stdout().is_terminal()
}

/// Format points in compact notation (1.5k, 2.3M, 847)
pub fn format_points(points: i64) -> String {
    let value = points as f64;
    let formatted = if value.abs() >= 1_000_000.0 {
        format!("{:.1}M", value / 1_000_000.0)
    } else if value.abs() >= 1_000.0 {
        format!("{:.1}k", value / 1_000.0)
    } else {
        format!("{}", points)
    };

    // Trim trailing .0 (e.g., "1.0k" -> "1k")
    formatted.replace(".0M", "M").replace(".0k", "k")
}

/// Get terminal width, defaulting to None for pipes (unlimited)
fn get_terminal_width() -> Option<usize> {
    terminal_size().map(|(Width(w), _)| w as usize)
}

/// Truncate to fit available width, accounting for Unicode
fn truncate(text: &str, max_width: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_width {
        text.to_string()
    } else if max_width > 3 {
        format!("{}...", chars[..max_width - 3].iter().collect::<String>())
    } else {
        chars[..max_width].iter().collect()
    }
}

/// "papers 20 · reviews 15", skipping empty categories
pub fn format_breakdown(entry: &LeaderboardEntry) -> String {
    Category::ALL
        .iter()
        .filter_map(|c| {
            entry
                .breakdown
                .get(c)
                .filter(|p| **p != 0)
                .map(|p| format!("{} {}", c, format_points(*p)))
        })
        .collect::<Vec<_>>()
        .join(" · ")
}

fn format_tags(entry: &LeaderboardEntry) -> String {
    let mut tags = vec![format!("{} {}", entry.badge.icon, entry.badge.label)];
    if let Some(admin) = &entry.admin_badge {
        tags.push(format!("{} {}", admin.icon, admin.label));
    }
    if let Some(role) = entry.gamification_role {
        tags.push(format!("{} {}", role.icon(), role.label()));
    }
    tags.join(" ")
}

/// Format a leaderboard page as a table with columns: Rank, Points, User, Badges
/// Rank column: 5 chars, right-aligned with trailing dot
/// Points column is right-aligned, 7 chars wide (fits "9999.9M")
pub fn format_leaderboard_table(page: &LeaderboardPage, use_colors: bool) -> String {
    let header = format!(
        "{} · {} ranked{}",
        page.scope,
        page.total_candidates,
        if page.stale { " (refreshing)" } else { "" }
    );
    let header = if use_colors {
        header.bold().to_string()
    } else {
        header
    };

    if page.entries.is_empty() {
        return format!("{}\nNo contributors in this scope.", header);
    }

    let term_width = get_terminal_width();
    let rank_width = 5;
    let points_width = 7;
    let separator = "  ";

    let rows = page.entries.iter().map(|entry| {
        let rank_str = format!("{:>width$}.", entry.rank, width = rank_width - 1);
        let points_padded = format!(
            "{:>width$}",
            format_points(entry.ranked_points),
            width = points_width
        );
        let tags = format_tags(entry);

        // Whatever is left after the fixed columns goes to the user label.
        let fixed_width = rank_width + 1 + points_width + separator.len() * 2 + tags.chars().count();
        let label = format!("{} ({}/{})", entry.user_id, entry.campus_id, entry.department_id);
        let label = match term_width {
            Some(width) if width > fixed_width + 10 => truncate(&label, width - fixed_width),
            Some(_) => truncate(&label, 20),
            None => label,
        };

        if use_colors {
            let rank_display = match entry.rank {
                1 => rank_str.yellow().bold().to_string(),
                2 | 3 => rank_str.bold().to_string(),
                _ => rank_str.dimmed().to_string(),
            };
            format!(
                "{} {}{}{}{}{}",
                rank_display,
                points_padded.bold(),
                separator,
                label,
                separator,
                tags.cyan()
            )
        } else {
            format!(
                "{} {}{}{}{}{}",
                rank_str, points_padded, separator, label, separator, tags
            )
        }
    });

    std::iter::once(header)
        .chain(rows)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format a leaderboard page as tab-separated values for scripting
/// Columns: rank, ranked points, total points, user, campus, department, badge
pub fn format_leaderboard_tsv(page: &LeaderboardPage) -> String {
    page.entries
        .iter()
        .map(|e| {
            format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                e.rank,
                e.ranked_points,
                e.total_points,
                e.user_id,
                e.campus_id,
                e.department_id,
                e.badge.label
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_leaderboard_json(page: &LeaderboardPage) -> serde_json::Result<String> {
    serde_json::to_string_pretty(page)
}

/// Format one user's standing plus their badge progress
pub fn format_my_rank(
    user_id: &str,
    scope: &Scope,
    rank: Option<&MyRank>,
    progress: &BadgeProgress,
    use_colors: bool,
) -> String {
    let standing = match rank {
        Some(r) => format!(
            "#{} of {} in {} with {} pts",
            r.rank,
            r.total_candidates,
            scope,
            format_points(r.ranked_points)
        ),
        None => format!("not ranked in {}", scope),
    };

    let next = match (&progress.next, progress.points_to_next) {
        (Some(next), Some(remaining)) => format!(
            "{} more to {} {}",
            format_points(remaining),
            next.icon,
            next.label
        ),
        _ => "top tier reached".to_string(),
    };

    if use_colors {
        format!(
            "{}: {}\n  Badge: {} {} ({})",
            user_id.bold(),
            standing,
            progress.current.icon,
            progress.current.label.cyan(),
            next.dimmed()
        )
    } else {
        format!(
            "{}: {}\n  Badge: {} {} ({})",
            user_id, standing, progress.current.icon, progress.current.label, next
        )
    }
}

/// Multi-line all-time totals for one user (for verbose and rebuild output)
pub fn format_contribution(contribution: &UserContribution) -> String {
    let mut lines = vec![format!(
        "{} ({}/{}): {} pts",
        contribution.user_id,
        contribution.campus_id,
        contribution.department_id,
        contribution.total_points
    )];
    for category in Category::ALL {
        let points = contribution.points_in(category);
        if points != 0 {
            lines.push(format!("  {:<10} {}", category.as_str(), points));
        }
    }
    if let Some(last) = contribution.last_activity_at {
        lines.push(format!("  last active {}", last.format("%Y-%m-%d %H:%M")));
    }
    lines.join("\n")
}
