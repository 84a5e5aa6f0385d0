//! Command-line overrides of the form `--section:sub:key value`.

use serde_yaml::{Mapping, Value};

use crate::error::{config_error, Result};

/// A single parsed override.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    /// Key path, `-` already normalized to `_`.
    pub path: Vec<String>,
    pub value: Value,
}

impl Override {
    /// Parse `key` (without the leading `--`) and its raw value.
    pub fn parse(key: &str, raw: &str) -> Result<Self> {
        let path: Vec<String> = key
            .split(':')
            .map(|k| k.replace('-', "_"))
            .collect();
        if path.iter().any(|k| k.is_empty()) {
            return Err(config_error(format!("malformed override key '--{key}'")));
        }
        Ok(Self {
            path,
            value: parse_value(raw),
        })
    }

    pub fn dotted(&self) -> String {
        self.path.join(":")
    }
}

/// Collect `--key value` / `--key=value` pairs from trailing arguments.
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<Override>> {
    let mut out = Vec::new();
    let mut iter = args.iter().map(AsRef::as_ref);
    while let Some(arg) = iter.next() {
        let key = arg
            .strip_prefix("--")
            .ok_or_else(|| config_error(format!("expected an option starting with '--', got '{arg}'")))?;
        match key.split_once('=') {
            Some((k, v)) => out.push(Override::parse(k, v)?),
            None => {
                let value = iter
                    .next()
                    .ok_or_else(|| config_error(format!("option '--{key}' is missing a value")))?;
                out.push(Override::parse(key, value)?);
            }
        }
    }
    Ok(out)
}

/// Interpret a raw override string.
///
/// Order: `True`/`False`, integer, float, `[a,b]` list, `a,b` list, otherwise
/// the string itself. List items are parsed with the same rules.
pub fn parse_value(raw: &str) -> Value {
    match raw {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        "None" | "null" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Number(f.into());
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        if inner.trim().is_empty() {
            return Value::Sequence(Vec::new());
        }
        return Value::Sequence(inner.split(',').map(|s| parse_value(s.trim())).collect());
    }
    if raw.contains(',') {
        return Value::Sequence(raw.split(',').map(|s| parse_value(s.trim())).collect());
    }
    Value::String(raw.to_string())
}

/// Set `path` under `node` if every segment already exists.
fn set_existing(node: &mut Value, path: &[String], value: &Value) -> bool {
    let Some((head, rest)) = path.split_first() else {
        return false;
    };
    let Some(map) = node.as_mapping_mut() else {
        return false;
    };
    let key = Value::String(head.clone());
    match map.get_mut(&key) {
        Some(child) if rest.is_empty() => {
            *child = value.clone();
            true
        }
        Some(child) => set_existing(child, rest, value),
        None => false,
    }
}

/// Replace every occurrence of `path` found at any depth below `node`.
fn set_anywhere(map: &mut Mapping, path: &[String], value: &Value) -> usize {
    let mut hits = 0;
    for (_, child) in map.iter_mut() {
        if set_existing(child, path, value) {
            hits += 1;
        } else if let Some(inner) = child.as_mapping_mut() {
            hits += set_anywhere(inner, path, value);
        }
    }
    hits
}

/// Merge one override into the configuration tree.
///
/// The path is resolved from the root first. If that fails (e.g. `--epochs 3`),
/// the path is matched below every section. A path that matches nothing is a
/// configuration error.
pub fn apply_override(root: &mut Value, ov: &Override) -> Result<()> {
    if set_existing(root, &ov.path, &ov.value) {
        return Ok(());
    }
    let hits = match root.as_mapping_mut() {
        Some(map) => set_anywhere(map, &ov.path, &ov.value),
        None => 0,
    };
    if hits == 0 {
        return Err(config_error(format!(
            "unknown configuration key '--{}'",
            ov.dotted()
        )));
    }
    Ok(())
}

pub fn apply_overrides(root: &mut Value, overrides: &[Override]) -> Result<()> {
    for ov in overrides {
        apply_override(root, ov)?;
        tracing::debug!(key = %ov.dotted(), value = ?ov.value, "applied config override");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_value;
    use crate::config::PpoConfig;
    use proptest::prelude::*;

    #[test]
    fn test_value_parsing_order() {
        assert_eq!(parse_value("True"), Value::Bool(true));
        assert_eq!(parse_value("False"), Value::Bool(false));
        assert_eq!(parse_value("3"), Value::Number(3.into()));
        assert_eq!(parse_value("1e-5"), Value::Number(1e-5.into()));
        assert_eq!(parse_value("0.5"), Value::Number(0.5.into()));
        assert_eq!(parse_value("cosine"), Value::String("cosine".into()));
        assert_eq!(
            parse_value("[0.9,0.95]"),
            Value::Sequence(vec![Value::Number(0.9.into()), Value::Number(0.95.into())])
        );
        assert_eq!(
            parse_value("a,b"),
            Value::Sequence(vec![Value::String("a".into()), Value::String("b".into())])
        );
    }

    #[test]
    fn test_key_dashes_become_underscores() {
        let ov = Override::parse("train-cfgs:update-iters", "2").unwrap();
        assert_eq!(ov.path, vec!["train_cfgs", "update_iters"]);
    }

    #[test]
    fn test_parse_args_pairs_and_equals() {
        let args = ["--train_cfgs:epochs", "3", "--model_cfgs:top_p=0.9"];
        let ovs = parse_args(&args).unwrap();
        assert_eq!(ovs.len(), 2);
        assert_eq!(ovs[1].path, vec!["model_cfgs", "top_p"]);
        assert!(parse_args(&["--train_cfgs:epochs"]).is_err());
        assert!(parse_args(&["epochs", "3"]).is_err());
    }

    #[test]
    fn test_full_path_override_reaches_typed_config() {
        let mut root = sample_value();
        let ovs = parse_args(&[
            "--train_cfgs:epochs",
            "3",
            "--train_cfgs:adam_betas",
            "[0.8,0.9]",
            "--train_cfgs:actor_lr_scheduler_type",
            "linear",
        ])
        .unwrap();
        apply_overrides(&mut root, &ovs).unwrap();
        let cfg = PpoConfig::from_value(root).unwrap();
        assert_eq!(cfg.train_cfgs.epochs, 3);
        assert_eq!(cfg.train_cfgs.adam_betas, (0.8, 0.9));
        // Siblings of the overridden key are untouched.
        assert_eq!(cfg.train_cfgs.kl_coeff, 0.02);
    }

    #[test]
    fn test_bare_key_matches_at_any_depth() {
        let mut root = sample_value();
        apply_override(&mut root, &Override::parse("kl_coeff", "0.1").unwrap()).unwrap();
        let cfg = PpoConfig::from_value(root).unwrap();
        assert_eq!(cfg.train_cfgs.kl_coeff, 0.1);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut root = sample_value();
        let err = apply_override(&mut root, &Override::parse("train_cfgs:nope", "1").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    proptest! {
        #[test]
        fn integers_round_trip_as_integers(n in -1_000_000i64..1_000_000) {
            prop_assert_eq!(parse_value(&n.to_string()), Value::Number(n.into()));
        }
    }
}
