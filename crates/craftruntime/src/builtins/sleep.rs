use crate::execution::ExecutionContext;
use craftcore::{AwaitingInfo, NodeContext, NodeDef, NodeResult, WorkflowError};
use chrono::Utc;
use serde_json::Value;

/// Suspends the workflow until `params.duration` has elapsed. Accepts a
/// millisecond number or a `<n><s|m|h|d>` string; negatives are rejected.
pub async fn run(
    ecx: &ExecutionContext,
    def: &NodeDef,
    nctx: &NodeContext,
) -> Result<NodeResult, WorkflowError> {
    let duration = nctx.require_param("duration")?;
    let millis = parse_duration_ms(duration).map_err(|message| {
        WorkflowError::Configuration(format!("node '{}': {message}", def.id))
    })?;
    let wake_up_at = Utc::now() + chrono::Duration::milliseconds(millis);
    let mut state = ecx.state.write().await;
    state
        .mark_awaiting(&def.id, AwaitingInfo::timer(wake_up_at))
        .await;
    Ok(NodeResult::empty())
}

pub(crate) fn parse_duration_ms(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            let millis = n
                .as_f64()
                .ok_or_else(|| format!("invalid duration {n}"))? as i64;
            if millis < 0 {
                return Err(format!("negative duration {millis}ms"));
            }
            Ok(millis)
        }
        Value::String(text) => parse_duration_str(text),
        other => Err(format!("invalid duration {other}")),
    }
}

fn parse_duration_str(text: &str) -> Result<i64, String> {
    if !text.is_ascii() {
        return Err(format!("invalid duration '{text}'"));
    }
    let (digits, unit) = text.split_at(text.len().saturating_sub(1));
    let per_unit = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(format!("invalid duration '{text}'")),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid duration '{text}'"));
    }
    digits
        .parse::<i64>()
        .map_err(|_| format!("invalid duration '{text}'"))
        .map(|n| n * per_unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_durations_are_milliseconds() {
        assert_eq!(parse_duration_ms(&json!(1500)), Ok(1500));
        assert_eq!(parse_duration_ms(&json!(0)), Ok(0));
        assert!(parse_duration_ms(&json!(-1)).is_err());
    }

    #[test]
    fn suffixed_durations() {
        assert_eq!(parse_duration_ms(&json!("1s")), Ok(1_000));
        assert_eq!(parse_duration_ms(&json!("10m")), Ok(600_000));
        assert_eq!(parse_duration_ms(&json!("2h")), Ok(7_200_000));
        assert_eq!(parse_duration_ms(&json!("1d")), Ok(86_400_000));
    }

    #[test]
    fn malformed_durations_are_rejected() {
        for bad in ["", "s", "1x", "1.5s", "-1s", "1 s", "oneminute"] {
            assert!(parse_duration_ms(&json!(bad)).is_err(), "accepted {bad:?}");
        }
        assert!(parse_duration_ms(&json!(true)).is_err());
        assert!(parse_duration_ms(&json!(null)).is_err());
    }
}
