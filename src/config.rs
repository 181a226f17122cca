//! Experiment configuration

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::{RetryPolicy, SamplingParams};
use crate::channel::AuthoringLimits;
use crate::error::ExperimentError;
use crate::generator::DEFAULT_SESSION_CHAR_BUDGET;

static EXPERIMENT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid experiment id regex"));

/// Short model names and the full names they stand for
pub const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-20250514"),
    ("sonnet", "claude-sonnet-4-20250514"),
    ("haiku", "claude-3-5-haiku-20241022"),
    ("big-base", "as-hackathon-big-base-rollout"),
    ("little-base", "as-hackathon-little-base-rollout"),
];

/// Full model name for an alias; anything else is passed through
pub fn resolve_model_name(model: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map_or(model, |(_, full)| *full)
}

/// Everything a run needs, persisted once as `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub experiment_id: String,

    pub leaf_examples_per_iteration: usize,
    pub parent_examples_per_iteration: usize,
    /// Cap on the accumulated parent pool
    pub max_parent_examples: usize,
    pub max_iterations: usize,

    pub sample_max_depth: usize,
    pub parent_max_depth: usize,
    pub leaf_max_depth: usize,

    /// One prompt per line
    pub writing_prompts_path: PathBuf,
    pub seed_leaf_examples: PathBuf,
    pub seed_parent_examples: PathBuf,
    /// Start the parent pool from the seed examples instead of empty
    pub keep_seed_parent_examples: bool,

    pub parent_total_char_limit: usize,
    pub parent_submit_char_limit: usize,
    /// Cumulative event characters per node before a forced submit
    pub session_char_budget: usize,

    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
    /// Trees generated at once in the sample and leaf steps
    pub max_concurrent_sessions: usize,

    /// Seed for prompt sampling and node selection
    pub rng_seed: Option<u64>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_id: String::new(),
            leaf_examples_per_iteration: 0,
            parent_examples_per_iteration: 0,
            max_parent_examples: 20,
            max_iterations: 1,
            sample_max_depth: 0,
            parent_max_depth: 1,
            leaf_max_depth: 0,
            writing_prompts_path: PathBuf::new(),
            seed_leaf_examples: PathBuf::new(),
            seed_parent_examples: PathBuf::new(),
            keep_seed_parent_examples: false,
            parent_total_char_limit: 2_000,
            parent_submit_char_limit: 500,
            session_char_budget: DEFAULT_SESSION_CHAR_BUDGET,
            model: "haiku".to_string(),
            temperature: 0.7,
            max_tokens: 2_048,
            retry: RetryPolicy::default(),
            max_concurrent_sessions: 8,
            rng_seed: None,
        }
    }
}

impl ExperimentConfig {
    /// Check every parameter before any work starts
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if !EXPERIMENT_ID.is_match(&self.experiment_id) {
            return Err(config_error(format!(
                "experiment id {:?} must be non-empty and use only letters, digits, '-' and '_'",
                self.experiment_id
            )));
        }
        if self.max_iterations == 0 {
            return Err(config_error("max_iterations must be positive"));
        }
        if self.leaf_examples_per_iteration == 0 && self.parent_examples_per_iteration == 0 {
            return Err(config_error("at least one of the per-iteration example counts must be positive"));
        }
        if self.max_parent_examples == 0 && self.keep_seed_parent_examples {
            return Err(config_error("keep_seed_parent_examples needs max_parent_examples > 0"));
        }

        for (name, path) in [
            ("writing_prompts_path", &self.writing_prompts_path),
            ("seed_leaf_examples", &self.seed_leaf_examples),
            ("seed_parent_examples", &self.seed_parent_examples),
        ] {
            if path.as_os_str().is_empty() {
                return Err(config_error(format!("{name} is required")));
            }
        }

        if self.parent_total_char_limit == 0 || self.parent_submit_char_limit == 0 {
            return Err(config_error("character limits must be positive"));
        }
        if self.parent_submit_char_limit > self.parent_total_char_limit {
            return Err(config_error("parent_submit_char_limit exceeds parent_total_char_limit"));
        }
        if self.session_char_budget == 0 {
            return Err(config_error("session_char_budget must be positive"));
        }
        if self.model.trim().is_empty() {
            return Err(config_error("model is required"));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(config_error(format!(
                "temperature {} outside 0.0..=1.0",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(config_error("max_tokens must be positive"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(config_error("max_concurrent_sessions must be positive"));
        }
        Ok(())
    }

    /// Prompts sampled per iteration
    pub fn prompts_per_iteration(&self) -> usize {
        self.leaf_examples_per_iteration.max(self.parent_examples_per_iteration)
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            model: resolve_model_name(&self.model).to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn authoring_limits(&self) -> AuthoringLimits {
        AuthoringLimits {
            total_chars: self.parent_total_char_limit,
            submit_chars: self.parent_submit_char_limit,
        }
    }
}

fn config_error(message: impl Into<String>) -> ExperimentError {
    ExperimentError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "exp_01-a".into(),
            leaf_examples_per_iteration: 4,
            parent_examples_per_iteration: 2,
            max_iterations: 3,
            sample_max_depth: 2,
            leaf_max_depth: 1,
            writing_prompts_path: "prompts.txt".into(),
            seed_leaf_examples: "leaf.json".into(),
            seed_parent_examples: "parent.json".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.prompts_per_iteration(), 4);
        assert_eq!(config.authoring_limits().total_chars, 2_000);
    }

    #[test]
    fn test_experiment_id_rules() {
        for bad in ["", "has space", "slash/", "dot.name"] {
            let config = ExperimentConfig {
                experiment_id: bad.into(),
                ..valid()
            };
            assert!(
                matches!(config.validate(), Err(ExperimentError::Config(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_parameter_ranges() {
        let cases = [
            ExperimentConfig { max_iterations: 0, ..valid() },
            ExperimentConfig { temperature: 1.5, ..valid() },
            ExperimentConfig { max_tokens: 0, ..valid() },
            ExperimentConfig { max_concurrent_sessions: 0, ..valid() },
            ExperimentConfig { parent_submit_char_limit: 5_000, ..valid() },
            ExperimentConfig { writing_prompts_path: PathBuf::new(), ..valid() },
            ExperimentConfig {
                leaf_examples_per_iteration: 0,
                parent_examples_per_iteration: 0,
                ..valid()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "accepted {config:?}");
        }
    }

    #[test]
    fn test_model_aliases() {
        assert_eq!(resolve_model_name("haiku"), "claude-3-5-haiku-20241022");
        assert_eq!(resolve_model_name("custom-model"), "custom-model");
        assert_eq!(valid().sampling_params().model, "claude-3-5-haiku-20241022");
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{"experiment_id": "x", "retry": {"max_retries": 1}}"#).unwrap();
        assert_eq!(config.max_parent_examples, 20);
        assert_eq!(config.parent_max_depth, 1);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.rng_seed, None);
        assert_eq!(config.max_concurrent_sessions, 8);
    }
}
