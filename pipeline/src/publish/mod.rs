//! Registry publishing: credentials, retry and the concurrent publisher.

pub mod credentials;
pub mod publisher;
pub mod retry;
pub mod session;

pub use credentials::{
    provider_for, AnonymousProvider, Credential, CredentialProvider, EcrProvider, EnvProvider,
    Secret,
};
pub use publisher::{
    Destination, PublishOptions, PublishReport, Publisher, PushResult, PushedImage,
};
pub use retry::{Backoff, RetryPolicy};
pub use session::RegistrySession;
