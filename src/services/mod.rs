//! Services module for ticket issuance and its integrations

pub mod email_resolution;
pub mod issuance;
pub mod mailer;
pub mod notification;
pub mod provider_sync;
pub mod qr_image;
pub mod recovery;
pub mod ticket_email;

pub use email_resolution::{resolve_email, sanitize_email, EmailSource};
pub use issuance::{IssuanceOutcome, IssuanceWorkflow};
pub use mailer::{HttpMailRelay, LogMailer, MailError, Mailer};
pub use notification::{MunicipalityNotifier, NotifyError};
pub use provider_sync::{NotReady, ProviderService};
pub use qr_image::{QrAssetService, QrError};
pub use recovery::{
    ClientTokenList, RecoveryError, RecoveryGrant, RecoveryRegistry, TicketSummary,
};
pub use ticket_email::{TicketEmailError, TicketEmailService};
