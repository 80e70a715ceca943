pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod provider;
pub mod session;
pub mod signature;
pub mod store;
pub mod template;

pub use cache::{ConfigCache, DEFAULT_PROJECT_TTL};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PromptPalConfig;
pub use dispatch::{ExecutionDispatcher, ExecutionError, ExecutionResult, RunRequest};
pub use error::PromptPalError;
pub use provider::{Completion, LlmProvider, OpenAiClient, ProviderError, ProviderParams};
pub use session::{Session, SessionError, SessionIssuer};
pub use signature::{SignatureError, SignatureVerifier};
pub use store::{MemoryStore, PgStore, Store, StoreError};
pub use template::{RenderError, RenderedConversation, RenderedMessage, TemplateRenderer};
