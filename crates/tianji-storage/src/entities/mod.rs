pub mod health_checks;
pub mod prompt_templates;
pub mod spend_logs;

pub use health_checks::Entity as HealthChecks;
pub use prompt_templates::Entity as PromptTemplates;
pub use spend_logs::Entity as SpendLogs;
