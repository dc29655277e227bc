use async_trait::async_trait;
use jiff::{civil::Weekday, tz::TimeZone, Zoned};
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolError};

pub struct CurrentTimeTool {
    default_timezone: String,
}

impl CurrentTimeTool {
    pub fn new(default_timezone: impl Into<String>) -> Self {
        Self {
            default_timezone: default_timezone.into(),
        }
    }

    fn resolve(name: &str) -> Result<TimeZone, jiff::Error> {
        if name.eq_ignore_ascii_case("utc") {
            return Ok(TimeZone::UTC);
        }
        TimeZone::get(name)
    }

    pub(crate) fn describe(timezone: &str, now: &Zoned) -> Value {
        json!({
            "success": true,
            "timezone": timezone,
            "datetime": now.strftime("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            "year": now.year(),
            "month": now.month(),
            "day": now.day(),
            "hour": now.hour(),
            "minute": now.minute(),
            "second": now.second(),
            "weekday": weekday_name(now.weekday()),
            "formatted": now.strftime("%Y-%m-%d %H:%M:%S %Z").to_string(),
        })
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Monday => "Monday",
        Weekday::Tuesday => "Tuesday",
        Weekday::Wednesday => "Wednesday",
        Weekday::Thursday => "Thursday",
        Weekday::Friday => "Friday",
        Weekday::Saturday => "Saturday",
        Weekday::Sunday => "Sunday",
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. You can optionally specify a timezone."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "description": "IANA timezone name (e.g. 'Asia/Shanghai', 'America/New_York', 'UTC'). Defaults to the server timezone."
                }
            },
            "required": []
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let timezone = input
            .get("timezone")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|tz| !tz.is_empty())
            .unwrap_or(&self.default_timezone)
            .to_string();

        match Self::resolve(&timezone) {
            Ok(tz) => Ok(Self::describe(&timezone, &Zoned::now().with_time_zone(tz))),
            Err(e) => Ok(json!({
                "success": false,
                "error": e.to_string(),
                "message": format!(
                    "Cannot get the time for timezone '{}'. Use a valid timezone name (e.g. 'Asia/Shanghai', 'UTC').",
                    timezone
                ),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_context() -> ToolContext {
        ToolContext::new(1, Vec::new())
    }

    #[tokio::test]
    async fn test_default_timezone_is_used() {
        let tool = CurrentTimeTool::new("UTC");
        let output = tool.execute(json!({}), &create_test_context()).await.unwrap();
        assert_eq!(output["success"], true);
        assert_eq!(output["timezone"], "UTC");
        assert!(output["datetime"].as_str().unwrap().ends_with("+00:00"));
        assert!((1..=12).contains(&output["month"].as_i64().unwrap()));
    }

    #[tokio::test]
    async fn test_invalid_timezone_is_reported() {
        let tool = CurrentTimeTool::new("UTC");
        let output = tool
            .execute(json!({"timezone": "Mars/Olympus_Mons"}), &create_test_context())
            .await
            .unwrap();
        assert_eq!(output["success"], false);
        assert!(output["message"].as_str().unwrap().contains("Mars/Olympus_Mons"));
    }

    #[test]
    fn test_describe_fixed_instant() {
        let zoned = "2024-03-15T10:20:30Z"
            .parse::<jiff::Timestamp>()
            .unwrap()
            .to_zoned(TimeZone::UTC);
        let output = CurrentTimeTool::describe("UTC", &zoned);
        assert_eq!(output["weekday"], "Friday");
        assert_eq!(output["hour"], 10);
        assert_eq!(output["datetime"], "2024-03-15T10:20:30+00:00");
        assert_eq!(output["formatted"], "2024-03-15 10:20:30 UTC");
    }
}
