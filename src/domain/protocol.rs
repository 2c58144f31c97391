use thiserror::Error;

/// One decoded line of device chatter. Decoding is total: malformed input
/// maps to `Unrecognized` so the pipeline can log and keep going.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    SlotOccupancy { slot_name: String, raw_status: String },
    SensorReading { slot_name: String, value: i64 },
    PingAck { slot_name: String },
    SignalStrength { rssi: i64 },
    Unrecognized { raw: String },
}

pub fn decode(line: &str) -> DeviceEvent {
    let trimmed = line.trim();
    let fields: Vec<&str> = trimmed.split(':').collect();

    if fields.len() < 2 {
        return unrecognized(line);
    }

    match fields[0].to_ascii_uppercase().as_str() {
        "SLOT" | "STATUS" if fields.len() >= 3 => DeviceEvent::SlotOccupancy {
            slot_name: fields[1].to_string(),
            // Unknown statuses are forwarded as-is; the state machine
            // decides validity so new firmware statuses do not get dropped
            // at the parse layer.
            raw_status: fields[2..].join(":").to_lowercase(),
        },
        "SENSOR" if fields.len() >= 3 => match fields[2].trim().parse::<i64>() {
            Ok(value) => DeviceEvent::SensorReading {
                slot_name: fields[1].to_string(),
                value,
            },
            Err(_) => unrecognized(line),
        },
        "PONG" => DeviceEvent::PingAck {
            slot_name: fields[1].to_string(),
        },
        "RSSI" => match fields[1].trim().parse::<i64>() {
            Ok(rssi) => DeviceEvent::SignalStrength { rssi },
            Err(_) => unrecognized(line),
        },
        _ => unrecognized(line),
    }
}

fn unrecognized(line: &str) -> DeviceEvent {
    DeviceEvent::Unrecognized {
        raw: line.to_string(),
    }
}

/// Width of the device's character LCD. Longer display text is truncated
/// rather than rejected.
pub const DISPLAY_WIDTH: usize = 16;

const SERVO_MAX_DEGREES: u16 = 180;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("servo angle {0} out of range 0-180")]
    ServoAngleOutOfRange(u16),
    #[error("invalid slot name {0:?}")]
    InvalidSlotName(String),
}

/// Outbound control command, serialized as `<TAG>:<args>\n`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping { slot_name: String },
    SetEnabled { slot_name: String, enabled: bool },
    SetServoAngle { degrees: u16 },
    SetDisplayText { text: String },
    RequestSensorRead { slot_name: String },
    RequestDistance,
}

impl Command {
    pub fn encode(&self) -> Result<String, EncodeError> {
        let body = match self {
            Self::Ping { slot_name } => format!("PING:{}", valid_slot_name(slot_name)?),
            Self::SetEnabled { slot_name, enabled } => {
                let tag = if *enabled { "ENABLE" } else { "DISABLE" };
                format!("{tag}:{}", valid_slot_name(slot_name)?)
            }
            Self::SetServoAngle { degrees } => {
                if *degrees > SERVO_MAX_DEGREES {
                    return Err(EncodeError::ServoAngleOutOfRange(*degrees));
                }
                format!("SERVO:{degrees}")
            }
            Self::SetDisplayText { text } => {
                let cleaned: String = text
                    .chars()
                    .filter(|c| *c != '\n' && *c != '\r')
                    .take(DISPLAY_WIDTH)
                    .collect();
                format!("LCD:{cleaned}")
            }
            Self::RequestSensorRead { slot_name } => {
                format!("READ:{}", valid_slot_name(slot_name)?)
            }
            Self::RequestDistance => "READ_DIST".to_string(),
        };

        // Exactly one terminator regardless of what went into the body.
        Ok(format!("{}\n", body.trim_end_matches(['\r', '\n'])))
    }
}

fn valid_slot_name(name: &str) -> Result<&str, EncodeError> {
    if name.is_empty() || name.contains([':', '\n', '\r']) {
        return Err(EncodeError::InvalidSlotName(name.to_string()));
    }
    Ok(name)
}
