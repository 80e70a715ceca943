pub mod metric;
pub mod page;
pub mod project;
pub mod prompt;
pub mod user;

pub use metric::{CallOutcome, ExecutionMetric, PromptCallCount, TopPrompt};
pub use page::{ListResponse, Pagination};
pub use project::{NewProject, ProjectConfig, ProjectPatch, ValidationError};
pub use prompt::{
    validate_declarations, MessageRow, NewPrompt, PromptPatch, PromptTemplate, PublicLevel,
    VariableDeclaration,
};
pub use user::{NewUser, User};
