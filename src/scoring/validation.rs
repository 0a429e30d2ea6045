use super::badges::BadgeRule;
use super::config::ScoringConfig;
use crate::activity::ActivityType;

/// Validate scoring configuration at startup.
/// Returns all validation errors at once (not just the first).
pub fn validate_scoring(config: &ScoringConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    for (name, weight) in &config.weights {
        if let Err(e) = name.parse::<ActivityType>() {
            errors.push(format!("scoring.weights.{}: {}", name, e));
        }
        // A zero weight would silently drop activity; negative would let
        // users lose points by contributing.
        if *weight <= 0 {
            errors.push(format!("scoring.weights.{}: must be positive, got {}", name, weight));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Badge tiers must be ordered, contiguous, start at zero and end open-ended.
pub fn validate_badges(rules: &[BadgeRule]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let Some(first) = rules.first() else {
        return Err(vec!["badges: at least one tier is required".to_string()]);
    };
    if first.min_points != 0 {
        errors.push(format!(
            "badges[0].min_points: first tier must start at 0, got {}",
            first.min_points
        ));
    }

    for (i, rule) in rules.iter().enumerate() {
        if rule.label.trim().is_empty() {
            errors.push(format!("badges[{}].label: must not be empty", i));
        }
        if let Some(max) = rule.max_points {
            if max <= rule.min_points {
                errors.push(format!(
                    "badges[{}]: max_points {} must be greater than min_points {}",
                    i, max, rule.min_points
                ));
            }
        }

        match (rule.max_points, rules.get(i + 1)) {
            (None, Some(_)) => errors.push(format!(
                "badges[{}].max_points: only the last tier may be open-ended",
                i
            )),
            (Some(max), Some(next)) if max < next.min_points => errors.push(format!(
                "badges[{}]: gap between {} and {}",
                i, max, next.min_points
            )),
            (Some(max), Some(next)) if max > next.min_points => errors.push(format!(
                "badges[{}]: overlaps badges[{}] ({} > {})",
                i,
                i + 1,
                max,
                next.min_points
            )),
            (Some(max), None) => errors.push(format!(
                "badges[{}].max_points: last tier must be open-ended, got {}",
                i, max
            )),
            _ => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
