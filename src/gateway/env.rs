use std::collections::BTreeMap;
use std::str::FromStr;

/// Layered variable source: dotenv entries first, then the process environment.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub fn load_dotenv(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::parse_dotenv(&raw))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let raw = self.get(key)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "on" => Some(true),
            "0" | "false" | "f" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.trim().parse::<T>().ok()
    }

    /// Comma or newline separated list, trimmed, empties dropped.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        let raw = self.get(key)?;
        let items: Vec<String> = raw
            .split([',', '\n'])
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        Some(items)
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_values_take_precedence_and_parse_typed() {
        let env = Env::parse_dotenv(
            "# comment\nexport HEIMDALL_TEST_FLAG=yes\nHEIMDALL_TEST_NUM = \"42\"\nHEIMDALL_TEST_LIST=a, b,,c\nEMPTY=\n",
        );
        assert_eq!(env.get_bool("HEIMDALL_TEST_FLAG"), Some(true));
        assert_eq!(env.get_parsed::<u32>("HEIMDALL_TEST_NUM"), Some(42));
        assert_eq!(
            env.get_list("HEIMDALL_TEST_LIST"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(!env.dotenv.contains_key("EMPTY"));
    }

    #[test]
    fn unparseable_bool_is_none() {
        let env = Env::parse_dotenv("HEIMDALL_TEST_BOOL=maybe");
        assert_eq!(env.get_bool("HEIMDALL_TEST_BOOL"), None);
    }
}
