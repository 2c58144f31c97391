/// Occupancy state of a single parking slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Vacant,
    Occupied,
    Overtime,
    Disabled,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vacant => "vacant",
            Self::Occupied => "occupied",
            Self::Overtime => "overtime",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "vacant" => Some(Self::Vacant),
            "occupied" => Some(Self::Occupied),
            "overtime" => Some(Self::Overtime),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotRecord {
    pub id: String,
    pub name: String,
    pub allowed_minutes: i64,
    pub is_disabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSlotRecord {
    pub name: String,
    pub allowed_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatusRecord {
    pub slot_id: String,
    pub status: String,
    pub occupied_since: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotWithStatus {
    pub slot: SlotRecord,
    pub status: SlotStatusRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParkingSessionRecord {
    pub id: String,
    pub slot_id: Option<String>,
    pub slot_name: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_minutes: i64,
    pub amount_charged: f64,
    pub was_overtime: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewParkingSessionRecord {
    pub slot_id: Option<String>,
    pub slot_name: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_minutes: i64,
    pub amount_charged: f64,
    pub was_overtime: bool,
    pub created_at: String,
}
