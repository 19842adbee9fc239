use crate::validity::{format_db_time, parse_db_time, Timestamp, ValidityError};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RollbackType {
    #[default]
    InsertDate,
    CreationDate,
}

impl RollbackType {
    pub fn column(&self) -> &'static str {
        match self {
            RollbackType::InsertDate => "INSERTDATE",
            RollbackType::CreationDate => "CREATIONDATE",
        }
    }
}

impl FromStr for RollbackType {
    type Err = ValidityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "INSERTDATE" => Ok(RollbackType::InsertDate),
            "CREATIONDATE" => Ok(RollbackType::CreationDate),
            other => Err(ValidityError::RollbackType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct PatternRule<T> {
    matcher: Regex,
    value: T,
}

fn compile_pattern(pattern: &str) -> Result<Regex, ValidityError> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err(ValidityError::TablePattern {
            pattern: pattern.to_string(),
            reason: "empty pattern".to_string(),
        });
    }
    let body = trimmed
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|err| ValidityError::TablePattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

// BTreeMap order puts `*` before letters, so walking in reverse visits the
// most specific pattern first.
fn lookup<'a, T>(rules: &'a BTreeMap<String, PatternRule<T>>, table_name: &str) -> Option<&'a T> {
    rules
        .values()
        .rev()
        .find(|rule| rule.matcher.is_match(table_name))
        .map(|rule| &rule.value)
}

#[derive(Debug, Clone, Default)]
pub struct RollbackDates {
    dates: BTreeMap<String, PatternRule<Timestamp>>,
    types: BTreeMap<String, PatternRule<RollbackType>>,
}

impl RollbackDates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_date(&mut self, pattern: &str, date: &str) -> Result<(), ValidityError> {
        let value = parse_db_time(date)?;
        let matcher = compile_pattern(pattern)?;
        self.dates
            .insert(pattern.trim().to_string(), PatternRule { matcher, value });
        Ok(())
    }

    pub fn set_type(&mut self, pattern: &str, kind: &str) -> Result<(), ValidityError> {
        let value = kind.parse::<RollbackType>()?;
        let matcher = compile_pattern(pattern)?;
        self.types
            .insert(pattern.trim().to_string(), PatternRule { matcher, value });
        Ok(())
    }

    pub fn date_for(&self, table_name: &str) -> Option<Timestamp> {
        lookup(&self.dates, table_name).copied()
    }

    pub fn type_for(&self, table_name: &str) -> RollbackType {
        lookup(&self.types, table_name).copied().unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.dates.is_empty()
    }

    pub fn clear(&mut self) {
        self.dates.clear();
        self.types.clear();
    }
}

impl fmt::Display for RollbackDates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dates.is_empty() {
            return f.write_str("Rollback Status: Not enabled");
        }
        writeln!(f, "Rollback Status:")?;
        writeln!(f, "  Dates:")?;
        for (pattern, rule) in self.dates.iter().rev() {
            writeln!(f, "    {pattern:<30}  {}", format_db_time(&rule.value))?;
        }
        write!(f, "  Rollback Type is 'INSERTDATE'")?;
        if !self.types.is_empty() {
            writeln!(f, " except as follows:")?;
            for (pattern, rule) in self.types.iter().rev() {
                writeln!(f, "    {pattern:<30}  {}", rule.value.column())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_patterns_win_over_generic_ones() {
        let mut rollback = RollbackDates::new();
        rollback.set_date("*", "2020-01-01 00:00:00").expect("generic");
        rollback.set_date("CAL*", "2021-01-01 00:00:00").expect("prefix");
        rollback.set_date("CALIB", "2022-01-01 00:00:00").expect("exact");

        let date = |table: &str| rollback.date_for(table).map(|ts| format_db_time(&ts));
        assert_eq!(date("CALIB").as_deref(), Some("2022-01-01 00:00:00"));
        assert_eq!(date("CALIBX").as_deref(), Some("2021-01-01 00:00:00"));
        assert_eq!(date("GEOMETRY").as_deref(), Some("2020-01-01 00:00:00"));
    }

    #[test]
    fn embedded_wildcards_match_and_literals_are_escaped() {
        let mut rollback = RollbackDates::new();
        rollback.set_date("A*_GAIN", "2021-06-01").expect("pattern");
        assert!(rollback.date_for("ABC_GAIN").is_some());
        assert!(rollback.date_for("ABC_GAINS").is_none());
        assert!(rollback.date_for("ABCXGAIN").is_none());
    }

    #[test]
    fn type_defaults_to_insert_date() {
        let mut rollback = RollbackDates::new();
        assert_eq!(rollback.type_for("ANY"), RollbackType::InsertDate);
        rollback.set_type("PED*", " creationdate ").expect("type");
        assert_eq!(rollback.type_for("PEDESTAL"), RollbackType::CreationDate);
        assert_eq!(rollback.type_for("GAIN"), RollbackType::InsertDate);
        assert_eq!(RollbackType::CreationDate.column(), "CREATIONDATE");
    }

    #[test]
    fn invalid_entries_are_rejected_without_side_effects() {
        let mut rollback = RollbackDates::new();
        assert!(rollback.set_date("CALIB", "not a date").is_err());
        assert!(rollback.set_type("CALIB", "SOMETIMES").is_err());
        assert!(rollback.set_date("  ", "2021-01-01").is_err());
        assert!(!rollback.is_enabled());
        assert_eq!(rollback.to_string(), "Rollback Status: Not enabled");
    }
}
