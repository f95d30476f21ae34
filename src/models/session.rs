//! Tutoring session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Cents;

/// Session lifecycle status
///
/// Moves forward only: `pending -> confirmed -> completed`, or to
/// `cancelled` from any state before `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Whether the session can still be confirmed or cancelled
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid session status: {}", s)),
        }
    }
}

/// Where the session takes place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Virtual,
    InPerson,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Virtual => write!(f, "virtual"),
            Self::InPerson => write!(f, "in_person"),
        }
    }
}

impl std::str::FromStr for SessionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "virtual" => Ok(Self::Virtual),
            "in_person" => Ok(Self::InPerson),
            _ => Err(anyhow::anyhow!("Invalid session type: {}", s)),
        }
    }
}

/// Payment progress as seen from the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
    #[default]
    Unpaid,
    Authorized,
    Paid,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl std::fmt::Display for SessionPaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unpaid => write!(f, "unpaid"),
            Self::Authorized => write!(f, "authorized"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
            Self::Refunded => write!(f, "refunded"),
            Self::PartiallyRefunded => write!(f, "partially_refunded"),
        }
    }
}

impl std::str::FromStr for SessionPaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unpaid" => Ok(Self::Unpaid),
            "authorized" => Ok(Self::Authorized),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            "partially_refunded" => Ok(Self::PartiallyRefunded),
            _ => Err(anyhow::anyhow!("Invalid payment status: {}", s)),
        }
    }
}

/// Outcome of the compensating refund issued on cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    NotRequired,
    Pending,
    Processed,
    Failed,
}

impl std::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRequired => write!(f, "not_required"),
            Self::Pending => write!(f, "pending"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RefundStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_required" => Ok(Self::NotRequired),
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("Invalid refund status: {}", s)),
        }
    }
}

/// Which side of a session a user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tutor,
    Student,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tutor => write!(f, "tutor"),
            Self::Student => write!(f, "student"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tutor" => Ok(Self::Tutor),
            "student" => Ok(Self::Student),
            _ => Err(anyhow::anyhow!("Invalid role: {}", s)),
        }
    }
}

/// A scheduled tutoring engagement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tutor_id: String,
    pub student_id: String,
    pub course_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub session_type: SessionType,
    pub location: Option<String>,
    pub meeting_url: Option<String>,
    pub notes: Option<String>,
    /// Nominal price at booking time
    pub price: Cents,
    pub tutor_confirmed: bool,
    pub student_confirmed: bool,
    pub completion_date: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancelled_by_role: Option<Role>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub hours_before_session: Option<i64>,
    pub refund_amount: Option<Cents>,
    pub refund_status: Option<RefundStatus>,
    pub refund_id: Option<String>,
    pub payment_status: SessionPaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new pending session
    pub fn new(input: &CreateBookingInput, price: Cents, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tutor_id: input.tutor_id.clone(),
            student_id: input.student_id.clone(),
            course_id: input.course_id.clone(),
            start_time: input.start_time,
            end_time: input.end_time,
            status: SessionStatus::Pending,
            session_type: input.session_type,
            location: input.location.clone(),
            meeting_url: input.meeting_url.clone(),
            notes: input.notes.clone(),
            price,
            tutor_confirmed: false,
            student_confirmed: false,
            completion_date: None,
            cancelled_by: None,
            cancelled_by_role: None,
            cancelled_at: None,
            cancellation_reason: None,
            hours_before_session: None,
            refund_amount: None,
            refund_status: None,
            refund_id: None,
            payment_status: SessionPaymentStatus::Unpaid,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end_time - self.start_time).num_minutes()
    }

    /// Role the given user plays in this session, if any
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.tutor_id == user_id {
            Some(Role::Tutor)
        } else if self.student_id == user_id {
            Some(Role::Student)
        } else {
            None
        }
    }

    pub fn participant_id(&self, role: Role) -> &str {
        match role {
            Role::Tutor => &self.tutor_id,
            Role::Student => &self.student_id,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.role_of(user_id).is_some()
    }
}

/// Input for booking a session
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingInput {
    pub student_id: String,
    pub tutor_id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub session_type: SessionType,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub meeting_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_input() -> CreateBookingInput {
        CreateBookingInput {
            student_id: "student-1".to_string(),
            tutor_id: "tutor-1".to_string(),
            course_id: Some("CS101".to_string()),
            start_time: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 3, 2, 10, 30, 0).unwrap(),
            notes: None,
            session_type: SessionType::Virtual,
            location: None,
            meeting_url: None,
        }
    }

    #[test]
    fn test_new_session_is_pending_and_unconfirmed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let session = Session::new(&sample_input(), Cents(7500), now);

        assert_eq!(session.status, SessionStatus::Pending);
        assert!(!session.tutor_confirmed);
        assert!(!session.student_confirmed);
        assert_eq!(session.payment_status, SessionPaymentStatus::Unpaid);
        assert_eq!(session.duration_minutes(), 90);
        assert_eq!(session.price, Cents(7500));
    }

    #[test]
    fn test_role_of() {
        let now = Utc::now();
        let session = Session::new(&sample_input(), Cents(5000), now);

        assert_eq!(session.role_of("tutor-1"), Some(Role::Tutor));
        assert_eq!(session.role_of("student-1"), Some(Role::Student));
        assert_eq!(session.role_of("someone-else"), None);
        assert_eq!(session.participant_id(Role::Student), "student-1");
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Confirmed,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("archived".parse::<SessionStatus>().is_err());
        assert!(SessionStatus::Confirmed.is_open());
        assert!(!SessionStatus::Completed.is_open());
    }

    #[test]
    fn test_session_type_serde() {
        let json = serde_json::to_string(&SessionType::InPerson).unwrap();
        assert_eq!(json, "\"in_person\"");
        assert_eq!("in_person".parse::<SessionType>().unwrap(), SessionType::InPerson);
    }

    #[test]
    fn test_booking_input_defaults() {
        let input: CreateBookingInput = serde_json::from_str(
            r#"{
                "student_id": "s",
                "tutor_id": "t",
                "start_time": "2026-03-02T09:00:00Z",
                "end_time": "2026-03-02T10:00:00Z"
            }"#,
        )
        .unwrap();

        assert_eq!(input.session_type, SessionType::Virtual);
        assert!(input.course_id.is_none());
    }
}
