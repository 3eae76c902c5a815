//! Reconstruction of the target program's environment.
//!
//! Nothing is inherited: the environment handed to exec is built solely from the container's
//! declared `KEY=VALUE` entries and travels by value into the exec call. The init process's own
//! environment is left untouched.

use std::ffi::CString;

use crate::config::ConfigError;

/// The target's complete environment, in declared order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    /// Build the environment from declared `KEY=VALUE` entries, splitting on the first `=`.
    ///
    /// Every entry is validated before anything is kept, so a bad entry never leaves a
    /// partially built environment behind. A repeated key replaces the earlier value in place.
    pub fn from_entries(
        entries: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Environment, ConfigError> {
        let mut vars: Vec<(String, String)> = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            let Some((key, value)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidEnvironment(entry.to_owned()));
            };
            if key.is_empty() || entry.contains('\0') {
                return Err(ConfigError::InvalidEnvironment(entry.to_owned()));
            }

            match vars.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value.to_owned(),
                None => vars.push((key.to_owned(), value.to_owned())),
            }
        }
        Ok(Environment { vars })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as `KEY=VALUE` C strings, ready to back an `envp` array.
    pub fn to_c_strings(&self) -> Vec<CString> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let mut kv = Vec::with_capacity(k.len() + v.len() + 1);
                kv.extend_from_slice(k.as_bytes());
                kv.push(b'=');
                kv.extend_from_slice(v.as_bytes());
                CString::new(kv).expect("NUL bytes are rejected in from_entries")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::{Alphanumeric, DistString};
    use rand::Rng;

    #[test]
    fn declared_variables_only() -> eyre::Result<()> {
        let env = Environment::from_entries(["PATH=/bin", "HOME=/root"])?;
        let vars: Vec<_> = env.iter().collect();
        assert_eq!(vars, vec![("PATH", "/bin"), ("HOME", "/root")]);
        Ok(())
    }

    #[test]
    fn nothing_inherited_from_the_running_process() -> eyre::Result<()> {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let count = rng.gen_range(0..8);
            let entries: Vec<String> = (0..count)
                .map(|i| {
                    let key = format!("K{i}_{}", Alphanumeric.sample_string(&mut rng, 6));
                    let value_len = rng.gen_range(0..12);
                    let value = Alphanumeric.sample_string(&mut rng, value_len);
                    format!("{key}={value}")
                })
                .collect();

            let env = Environment::from_entries(&entries)?;
            let rendered: Vec<String> = env
                .to_c_strings()
                .into_iter()
                .map(|c| c.into_string().unwrap())
                .collect();
            assert_eq!(rendered, entries);

            for (key, _) in std::env::vars() {
                assert!(env.get(&key).is_none(), "{key} leaked into the environment");
            }
        }
        Ok(())
    }

    #[test]
    fn splits_on_first_equals() -> eyre::Result<()> {
        let env = Environment::from_entries(["OPTS=a=b=c", "EMPTY="])?;
        assert_eq!(env.get("OPTS"), Some("a=b=c"));
        assert_eq!(env.get("EMPTY"), Some(""));
        Ok(())
    }

    #[test]
    fn entry_without_equals_is_rejected_whole() {
        let err = Environment::from_entries(["PATH=/bin", "NOEQUALS", "HOME=/root"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvironment(ref e) if e == "NOEQUALS"));
        assert!(err.to_string().contains("invalid environment entry"));
    }

    #[test]
    fn repeated_key_keeps_position_and_last_value() -> eyre::Result<()> {
        let env = Environment::from_entries(["A=1", "B=2", "A=3"])?;
        let vars: Vec<_> = env.iter().collect();
        assert_eq!(vars, vec![("A", "3"), ("B", "2")]);
        Ok(())
    }

    #[test]
    fn empty_declaration_yields_empty_environment() -> eyre::Result<()> {
        let env = Environment::from_entries(Vec::<String>::new())?;
        assert!(env.is_empty());
        assert!(env.to_c_strings().is_empty());
        Ok(())
    }
}
