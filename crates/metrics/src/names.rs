//! Metric name constants emitted through the `metrics` facade.

/// Total LLM dispatch attempts, labeled by provider.
pub const LLM_REQUESTS_TOTAL: &str = "switchyard_llm_requests_total";
/// Successful completions, labeled by provider.
pub const LLM_COMPLETIONS_TOTAL: &str = "switchyard_llm_completions_total";
/// Failed completions, labeled by provider.
pub const LLM_ERRORS_TOTAL: &str = "switchyard_llm_errors_total";
/// Prompt tokens consumed, labeled by provider.
pub const LLM_PROMPT_TOKENS_TOTAL: &str = "switchyard_llm_prompt_tokens_total";
/// Completion tokens generated, labeled by provider.
pub const LLM_COMPLETION_TOKENS_TOTAL: &str = "switchyard_llm_completion_tokens_total";
/// End-to-end upstream call duration in seconds.
pub const LLM_DURATION_SECONDS: &str = "switchyard_llm_duration_seconds";
