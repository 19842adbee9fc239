use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlQualifiers {
    pub context: String,
    pub data: String,
    pub fill_opts: String,
}

impl SqlQualifiers {
    pub fn new(
        context: impl Into<String>,
        data: impl Into<String>,
        fill_opts: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            data: data.into(),
            fill_opts: fill_opts.into(),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut parts = text.splitn(3, ';').map(str::trim);
        Self {
            context: parts.next().unwrap_or_default().to_string(),
            data: parts.next().unwrap_or_default().to_string(),
            fill_opts: parts.next().unwrap_or_default().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty() && self.data.is_empty() && self.fill_opts.is_empty()
    }

    pub fn is_extended_context(&self) -> bool {
        !self.context.is_empty()
    }
}

impl fmt::Display for SqlQualifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{};{};{}", self.context, self.data, self.fill_opts)
    }
}
