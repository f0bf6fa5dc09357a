//! Current time tool — tells the model what "now" is.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolOutput};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally shifted to a UTC offset in minutes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "minimum": -720,
                    "maximum": 840,
                    "description": "Offset from UTC in minutes, e.g. 330 for India"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let minutes = arguments
            .get("utc_offset_minutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let offset = i32::try_from(minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ToolError::InvalidArguments(format!("offset {minutes} minutes is out of range")))?;

        let now = Utc::now();
        Ok(ToolOutput::Json(serde_json::json!({
            "iso8601": now.with_timezone(&offset).to_rfc3339(),
            "unix": now.timestamp(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn utc_by_default() {
        let out = CurrentTimeTool.execute(serde_json::json!({})).await.unwrap();
        let ToolOutput::Json(v) = out else { panic!("expected JSON") };
        assert!(v["iso8601"].as_str().unwrap().ends_with("+00:00"));
        assert!(v["unix"].as_i64().unwrap() > 1_600_000_000);
    }

    #[tokio::test]
    async fn applies_offset() {
        let out = CurrentTimeTool
            .execute(serde_json::json!({"utc_offset_minutes": 330}))
            .await
            .unwrap();
        let ToolOutput::Json(v) = out else { panic!("expected JSON") };
        assert!(v["iso8601"].as_str().unwrap().ends_with("+05:30"));
    }

    #[tokio::test]
    async fn rejects_absurd_offset() {
        let err = CurrentTimeTool
            .execute(serde_json::json!({"utc_offset_minutes": 100_000}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
