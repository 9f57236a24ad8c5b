// ABOUTME: Environment readers with validation and logged fallbacks
// ABOUTME: Lets callers inject a variable source so settings can be tested without touching process env

use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::RangeInclusive;
use std::str::FromStr;

use tracing::warn;

/// Source of configuration variables
pub trait EnvSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads from the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Trimmed, non-empty value of a variable
pub fn string(env: &dyn EnvSource, name: &str) -> Option<String> {
    env.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` when unset or unparseable
pub fn parse_or<T>(env: &dyn EnvSource, name: &str, default: T) -> T
where
    T: FromStr + Debug,
{
    match string(env, name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    "Ignoring invalid value {:?} for {}, using default {:?}",
                    raw, name, default
                );
                default
            }
        },
        None => default,
    }
}

/// Parse a variable that must fall inside `range`
pub fn parse_in_range<T>(env: &dyn EnvSource, name: &str, default: T, range: RangeInclusive<T>) -> T
where
    T: FromStr + PartialOrd + Debug + Copy,
{
    let value = parse_or(env, name, default);
    if range.contains(&value) {
        value
    } else {
        warn!(
            "{} = {:?} is outside {:?}, using default {:?}",
            name, value, range, default
        );
        default
    }
}

/// Boolean flag accepting 1/0, true/false, yes/no, on/off
pub fn flag(env: &dyn EnvSource, name: &str, default: bool) -> bool {
    match string(env, name).map(|v| v.to_ascii_lowercase()) {
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!("Ignoring invalid flag {:?} for {}, using {}", v, name, default);
                default
            }
        },
        None => default,
    }
}

/// Comma-separated list, empty items dropped
pub fn list(env: &dyn EnvSource, name: &str) -> Option<Vec<String>> {
    string(env, name).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_or_falls_back_on_garbage() {
        let env = source(&[("A", "12"), ("B", "twelve")]);
        assert_eq!(parse_or(&env, "A", 3u32), 12);
        assert_eq!(parse_or(&env, "B", 3u32), 3);
        assert_eq!(parse_or(&env, "MISSING", 3u32), 3);
    }

    #[test]
    fn test_parse_in_range() {
        let env = source(&[("LOW", "0"), ("OK", "10")]);
        assert_eq!(parse_in_range(&env, "LOW", 5u64, 1..=60), 5);
        assert_eq!(parse_in_range(&env, "OK", 5u64, 1..=60), 10);
    }

    #[rstest]
    #[case("true", true)]
    #[case("1", true)]
    #[case("ON", true)]
    #[case("no", false)]
    #[case("0", false)]
    #[case("maybe", false)]
    fn test_flag(#[case] raw: &str, #[case] expected: bool) {
        let env = source(&[("FLAG", raw)]);
        assert_eq!(flag(&env, "FLAG", false), expected);
    }

    #[test]
    fn test_list_and_string_trim() {
        let env = source(&[("L", " none, bridge ,,"), ("S", "   ")]);
        assert_eq!(
            list(&env, "L"),
            Some(vec!["none".to_string(), "bridge".to_string()])
        );
        assert_eq!(string(&env, "S"), None);
    }
}
