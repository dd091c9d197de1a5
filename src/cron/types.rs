use serde::{Deserialize, Serialize};

/// When a job fires: fixed interval, cron expression, or one absolute
/// time (one-shot; the job is disabled after it runs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CronSchedule {
    Every {
        every_ms: i64,
    },
    Cron {
        expr: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    At {
        at_ms: i64,
    },
}

impl CronSchedule {
    pub fn every(every_ms: i64) -> Self {
        Self::Every { every_ms }
    }

    pub fn cron(expr: impl Into<String>, tz: Option<&str>) -> Self {
        Self::Cron {
            expr: expr.into(),
            tz: tz.map(ToOwned::to_owned),
        }
    }

    pub fn at(at_ms: i64) -> Self {
        Self::At { at_ms }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::At { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Every { every_ms } => format!("every {}s", every_ms / 1000),
            Self::Cron { expr, tz: None } => expr.clone(),
            Self::Cron { expr, tz: Some(tz) } => format!("{expr} [{tz}]"),
            Self::At { at_ms } => format!("at {at_ms}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CronPayload {
    pub message: String,
    pub deliver: bool,
    pub channel: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CronJobState {
    pub next_run_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub run_count: u64,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStore {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for CronStore {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_serializes_with_kind_tag() {
        let every = serde_json::to_value(CronSchedule::every(5_000)).expect("serialize");
        assert_eq!(every["kind"], "every");
        assert_eq!(every["everyMs"], 5000);

        let cron = serde_json::to_value(CronSchedule::cron("0 9 * * *", Some("Europe/Paris")))
            .expect("serialize");
        assert_eq!(cron["kind"], "cron");
        assert_eq!(cron["tz"], "Europe/Paris");

        let at = serde_json::to_value(CronSchedule::at(123)).expect("serialize");
        assert_eq!(at["kind"], "at");
        assert_eq!(at["atMs"], 123);
    }

    #[test]
    fn one_shot_detection() {
        assert!(CronSchedule::at(1).is_one_shot());
        assert!(!CronSchedule::every(1).is_one_shot());
    }

    #[test]
    fn store_round_trips() {
        let store = CronStore {
            version: 1,
            jobs: vec![CronJob {
                id: "abc123".to_string(),
                name: "tick".to_string(),
                enabled: true,
                schedule: CronSchedule::every(60_000),
                payload: CronPayload {
                    message: "tick".to_string(),
                    deliver: true,
                    channel: Some("telegram".to_string()),
                    to: Some("42".to_string()),
                },
                state: CronJobState::default(),
                created_at_ms: 1,
                updated_at_ms: 1,
            }],
        };
        let text = serde_json::to_string(&store).expect("serialize");
        let parsed: CronStore = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed.jobs.len(), 1);
        assert_eq!(parsed.jobs[0].payload.to.as_deref(), Some("42"));
        assert_eq!(parsed.jobs[0].schedule, CronSchedule::every(60_000));
    }
}
