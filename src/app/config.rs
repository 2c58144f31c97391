use crate::app::AppError;
use crate::domain::billing::BillingPolicy;
use crate::domain::framing::DEFAULT_MAX_LINE_BYTES;

const DEFAULT_BASE_FEE: f64 = 25.0;
const DEFAULT_OVERTIME_FEE: f64 = 100.0;
const DEFAULT_RATE_PER_HOUR: f64 = 25.0;
const DEFAULT_OVERTIME_RATE_PER_HOUR: f64 = 100.0;

/// Where the device byte stream comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSource {
    /// Socket address of the serial bridge (e.g. an rfcomm bind or the
    /// hardware simulator).
    Tcp { addr: String },
    /// Scripted capture replayed from a JSON file.
    Replay { path: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub device_source: DeviceSource,
    pub db_path: String,
    pub http_bind: String,
    pub billing: BillingPolicy,
    pub default_allowed_minutes: i64,
    pub max_line_bytes: usize,
    pub reconnect_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device_addr = non_empty(&lookup, "DEVICE_ADDR");
        let replay_file = non_empty(&lookup, "REPLAY_FILE");

        let device_source = match (device_addr, replay_file) {
            (_, Some(path)) => DeviceSource::Replay { path },
            (Some(addr), None) => DeviceSource::Tcp { addr },
            (None, None) => {
                return Err(AppError::config("DEVICE_ADDR or REPLAY_FILE is required"));
            }
        };

        Ok(Self {
            device_source,
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/parksense/parksense.db".to_string()),
            http_bind: non_empty(&lookup, "HTTP_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            billing: billing_policy(&lookup)?,
            default_allowed_minutes: parse_or_default(&lookup, "DEFAULT_ALLOWED_MINUTES", 60_i64)?,
            max_line_bytes: parse_or_default(&lookup, "MAX_LINE_BYTES", DEFAULT_MAX_LINE_BYTES)?,
            reconnect_delay_ms: parse_or_default(&lookup, "RECONNECT_DELAY_MS", 3000_u64)?,
            read_timeout_ms: parse_or_default(&lookup, "READ_TIMEOUT_MS", 500_u64)?,
        })
    }
}

fn billing_policy<F>(lookup: &F) -> Result<BillingPolicy, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let policy = non_empty(lookup, "BILLING_POLICY").unwrap_or_else(|| "flat".to_string());

    match policy.to_ascii_lowercase().as_str() {
        "flat" => Ok(BillingPolicy::Flat {
            base_fee: parse_or_default(lookup, "BASE_FEE", DEFAULT_BASE_FEE)?,
            overtime_fee: parse_or_default(lookup, "OVERTIME_FEE", DEFAULT_OVERTIME_FEE)?,
        }),
        "hourly" => Ok(BillingPolicy::Hourly {
            rate_per_hour: parse_or_default(lookup, "RATE_PER_HOUR", DEFAULT_RATE_PER_HOUR)?,
            overtime_rate_per_hour: parse_or_default(
                lookup,
                "OVERTIME_RATE_PER_HOUR",
                DEFAULT_OVERTIME_RATE_PER_HOUR,
            )?,
        }),
        other => Err(AppError::config(format!(
            "BILLING_POLICY must be \"flat\" or \"hourly\", got {other:?}"
        ))),
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}
