//! Configuration management for StakeQuiz
//!
//! Economic bounds, per-phase deadlines and session shape. Loaded from a
//! TOML file, optionally overridden by `STAKEQUIZ_*` environment variables,
//! and validated before the engine accepts it.

use crate::error::{Error, Result};
use crate::protocol::{MAX_QUESTIONS, TOPIC_COUNT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizConfig {
    pub stake: StakeConfig,
    pub timeouts: TimeoutConfig,
    pub session: SessionConfig,
}

/// Accepted stake range, in the smallest currency unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeConfig {
    pub min_stake: u64,
    pub max_stake: u64,
}

/// Deadline of every waiting phase, measured from phase entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde")]
    pub randomness: Duration,
    #[serde(with = "humantime_serde")]
    pub content: Duration,
    /// Per-question answer window
    #[serde(with = "humantime_serde")]
    pub question: Duration,
    #[serde(with = "humantime_serde")]
    pub verification: Duration,
}

/// Shape of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Distinct topic preferences a participant must name
    pub min_topic_preferences: usize,
    /// Topics drawn from the preferences once randomness arrives
    pub topics_per_session: usize,
    /// Question count requested from the compute oracle
    pub questions_per_session: u8,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            min_stake: 1,
            max_stake: 1_000_000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            randomness: Duration::from_secs(300),
            content: Duration::from_secs(600),
            question: Duration::from_secs(60),
            verification: Duration::from_secs(300),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_topic_preferences: 5,
            topics_per_session: 3,
            questions_per_session: 10,
        }
    }
}

impl QuizConfig {
    /// Load configuration from `STAKEQUIZ_CONFIG` when set, otherwise
    /// defaults, then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("STAKEQUIZ_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.override_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: QuizConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Override configuration with environment variables
    pub fn override_from_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment, tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("STAKEQUIZ_MIN_STAKE") {
            self.stake.min_stake = parse_value(&val, "min stake")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_MAX_STAKE") {
            self.stake.max_stake = parse_value(&val, "max stake")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_RANDOMNESS_TIMEOUT") {
            self.timeouts.randomness = parse_duration(&val, "randomness timeout")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_CONTENT_TIMEOUT") {
            self.timeouts.content = parse_duration(&val, "content timeout")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_QUESTION_TIMEOUT") {
            self.timeouts.question = parse_duration(&val, "question timeout")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_VERIFICATION_TIMEOUT") {
            self.timeouts.verification = parse_duration(&val, "verification timeout")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_QUESTIONS_PER_SESSION") {
            self.session.questions_per_session = parse_value(&val, "questions per session")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_MIN_TOPIC_PREFERENCES") {
            self.session.min_topic_preferences = parse_value(&val, "min topic preferences")?;
        }
        if let Some(val) = lookup("STAKEQUIZ_TOPICS_PER_SESSION") {
            self.session.topics_per_session = parse_value(&val, "topics per session")?;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.stake.min_stake == 0 {
            return Err(Error::Config("Min stake must be > 0".to_string()));
        }

        if self.stake.min_stake > self.stake.max_stake {
            return Err(Error::Config("Min stake cannot exceed max stake".to_string()));
        }

        let timeouts = [
            ("randomness", self.timeouts.randomness),
            ("content", self.timeouts.content),
            ("question", self.timeouts.question),
            ("verification", self.timeouts.verification),
        ];
        for (name, timeout) in timeouts {
            if timeout.as_secs() == 0 {
                return Err(Error::Config(format!(
                    "{} timeout must be at least one second",
                    name
                )));
            }
        }

        let session = &self.session;
        if session.topics_per_session == 0 {
            return Err(Error::Config("Topics per session must be > 0".to_string()));
        }

        if session.topics_per_session > session.min_topic_preferences {
            return Err(Error::Config(
                "Topics per session cannot exceed the minimum preference count".to_string(),
            ));
        }

        if session.min_topic_preferences > TOPIC_COUNT {
            return Err(Error::Config(format!(
                "Minimum preference count cannot exceed the {} available topics",
                TOPIC_COUNT
            )));
        }

        if session.questions_per_session == 0 || session.questions_per_session > MAX_QUESTIONS {
            return Err(Error::Config(format!(
                "Questions per session must be between 1 and {}",
                MAX_QUESTIONS
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml()?)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Short deadlines for simulations and integration tests
    pub fn fast() -> Self {
        Self {
            timeouts: TimeoutConfig {
                randomness: Duration::from_secs(5),
                content: Duration::from_secs(5),
                question: Duration::from_secs(5),
                verification: Duration::from_secs(5),
            },
            ..Self::default()
        }
    }
}

fn parse_value<T: std::str::FromStr>(val: &str, what: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid {}: {}", what, val)))
}

fn parse_duration(val: &str, what: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(val.trim())
        .map_err(|e| Error::Config(format!("Invalid {}: {}", what, e)))
}
