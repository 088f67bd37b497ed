pub mod email_verification;
pub mod execution;
pub mod notification_send;
pub mod task;
pub mod user;
pub mod webhook_delivery;

pub use email_verification::EmailVerificationRepository;
pub use execution::{ExecutionRepository, FinalizeSuccess};
pub use notification_send::NotificationSendRepository;
pub use task::TaskRepository;
pub use user::UserRepository;
pub use webhook_delivery::WebhookDeliveryRepository;
