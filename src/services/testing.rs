//! Test harness wiring services to in-memory SQLite and a fake processor

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, NaiveTime, Utc};

use crate::config::PolicyConfig;
use crate::db::repositories::{
    PaymentTransactionRepository, PendingTransferRepository, SessionRepository,
    SqlxPaymentTransactionRepository, SqlxPendingTransferRepository, SqlxSessionRepository,
    SqlxTutorProfileRepository, SqlxWebhookEventRepository, TutorProfileRepository,
    WebhookEventRepository,
};
use crate::db::{create_test_pool, migrations, DynDatabasePool};
use crate::models::{
    Cents, CreateBookingInput, PaymentTransaction, PaymentType, Role, Session, SessionType,
    TimeRange, TransactionStatus, TutorProfile, WeeklyAvailability,
};
use crate::payments::testing::FakeProcessor;
use crate::services::notification::tests::RecordingNotifier;
use crate::services::{
    BookingService, CancellationService, ConfirmationService, NotificationDispatcher, NoopMeetings,
    PaymentGateway, SettlementService, WebhookService,
};

pub const WEBHOOK_SECRET: &str = "whsec_test";

pub struct Harness {
    pub pool: DynDatabasePool,
    pub sessions: Arc<dyn SessionRepository>,
    pub transactions: Arc<dyn PaymentTransactionRepository>,
    pub transfers: Arc<dyn PendingTransferRepository>,
    pub tutors: Arc<dyn TutorProfileRepository>,
    pub events: Arc<dyn WebhookEventRepository>,
    pub processor: FakeProcessor,
    pub notifier: Arc<RecordingNotifier>,
    pub policy: PolicyConfig,
    next_slot: AtomicI64,
}

/// Every day open 06:00-22:00
pub fn open_every_day() -> WeeklyAvailability {
    let range = TimeRange::new(
        NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
    );
    let mut availability = WeeklyAvailability::default();
    for day in [
        chrono::Weekday::Mon,
        chrono::Weekday::Tue,
        chrono::Weekday::Wed,
        chrono::Weekday::Thu,
        chrono::Weekday::Fri,
        chrono::Weekday::Sat,
        chrono::Weekday::Sun,
    ] {
        availability.ranges_for_mut(day).push(range);
    }
    availability
}

impl Harness {
    pub async fn new() -> Self {
        let pool = create_test_pool().await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        Self {
            sessions: SqlxSessionRepository::boxed(pool.clone()),
            transactions: SqlxPaymentTransactionRepository::boxed(pool.clone()),
            transfers: SqlxPendingTransferRepository::boxed(pool.clone()),
            tutors: SqlxTutorProfileRepository::boxed(pool.clone()),
            events: SqlxWebhookEventRepository::boxed(pool.clone()),
            pool,
            processor: FakeProcessor::new(),
            notifier: Arc::new(RecordingNotifier::default()),
            policy: PolicyConfig::default(),
            next_slot: AtomicI64::new(0),
        }
    }

    pub fn notifications(&self) -> NotificationDispatcher {
        NotificationDispatcher::new(self.notifier.clone())
    }

    pub fn gateway(&self) -> PaymentGateway {
        PaymentGateway::new(
            self.sessions.clone(),
            self.transactions.clone(),
            self.tutors.clone(),
            Arc::new(self.processor.clone()),
            self.policy.clone(),
            "usd",
        )
    }

    pub fn settlement(&self) -> SettlementService {
        SettlementService::new(
            self.sessions.clone(),
            self.transactions.clone(),
            self.transfers.clone(),
            self.tutors.clone(),
            Arc::new(self.processor.clone()),
            self.policy.clone(),
            "usd",
        )
    }

    pub fn confirmation(&self) -> ConfirmationService {
        ConfirmationService::new(self.sessions.clone(), Arc::new(self.settlement()), self.notifications())
    }

    pub fn cancellation(&self) -> CancellationService {
        CancellationService::new(
            self.sessions.clone(),
            self.transactions.clone(),
            self.transfers.clone(),
            Arc::new(self.processor.clone()),
            Arc::new(NoopMeetings),
            self.notifications(),
            self.policy.clone(),
        )
    }

    pub fn booking(&self) -> BookingService {
        BookingService::new(
            self.sessions.clone(),
            self.tutors.clone(),
            Arc::new(self.gateway()),
            self.notifications(),
            self.policy.clone(),
        )
    }

    pub fn webhooks(&self) -> WebhookService {
        WebhookService::new(
            self.events.clone(),
            self.transactions.clone(),
            self.sessions.clone(),
            self.tutors.clone(),
            Arc::new(self.settlement()),
            Arc::new(self.cancellation()),
            WEBHOOK_SECRET,
            300,
        )
    }

    /// Store a tutor profile and register its payout account with the fake
    pub async fn seed_tutor(&self, tutor_id: &str, account: Option<&str>, onboarded: bool) -> TutorProfile {
        if let Some(account) = account {
            self.processor.add_account(account, onboarded);
        }
        let now = Utc::now();
        self.tutors
            .upsert(&TutorProfile {
                tutor_id: tutor_id.to_string(),
                hourly_rate: Cents(6000),
                payout_account_id: account.map(str::to_string),
                payout_onboarded: onboarded,
                availability: open_every_day(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap()
    }

    /// A pending 60-minute session starting at `start`
    pub async fn seed_session_at(&self, tutor_id: &str, student_id: &str, start: DateTime<Utc>) -> Session {
        let input = CreateBookingInput {
            student_id: student_id.to_string(),
            tutor_id: tutor_id.to_string(),
            course_id: None,
            start_time: start,
            end_time: start + Duration::minutes(60),
            notes: None,
            session_type: SessionType::Virtual,
            location: None,
            meeting_url: Some("https://meet.example.com/room-1".to_string()),
        };
        let session = Session::new(&input, Cents(10000), Utc::now());
        assert!(self.sessions.create(&session).await.unwrap());
        session
    }

    /// A pending session two days out; each call picks a distinct hour
    pub async fn seed_session(&self, tutor_id: &str, student_id: &str) -> Session {
        let offset = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let base = Utc::now()
            .duration_trunc(Duration::hours(1))
            .unwrap_or_else(|_| Utc::now());
        self.seed_session_at(tutor_id, student_id, base + Duration::hours(48 + offset * 2))
            .await
    }

    /// Record a captured payment for the session, as the success webhook would
    pub async fn seed_payment(&self, session: &Session, payment_type: PaymentType, amount: i64) -> PaymentTransaction {
        let now = Utc::now();
        let fee = Cents(amount).apply_bps(self.policy.platform_fee_bps);
        let tx = PaymentTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            student_id: session.student_id.clone(),
            tutor_id: session.tutor_id.clone(),
            amount: Cents(amount),
            currency: "usd".to_string(),
            status: TransactionStatus::Completed,
            payment_intent_id: format!("pi_seed_{}", session.id),
            charge_id: Some(format!("ch_seed_{}", session.id)),
            platform_fee: fee,
            payment_type,
            requires_transfer: payment_type == PaymentType::TwoStage,
            transfer_id: None,
            failure_code: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        assert!(self.transactions.create(&tx).await.unwrap());
        self.sessions.mark_paid(&session.id, now).await.unwrap();
        tx
    }

    /// Both parties confirm; the session becomes completed
    pub async fn complete(&self, session: &Session) {
        let now = Utc::now();
        self.sessions.set_confirmation(&session.id, Role::Tutor, now).await.unwrap();
        self.sessions.set_confirmation(&session.id, Role::Student, now).await.unwrap();
        assert!(self.sessions.mark_completed(&session.id, now).await.unwrap());
    }

    pub async fn reload(&self, session: &Session) -> Session {
        self.sessions.get_by_id(&session.id).await.unwrap().unwrap()
    }
}
