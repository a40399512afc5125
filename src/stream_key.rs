//! Deterministic grouping keys for label sets.

use crate::pool;
use crate::record::Labels;

/// Build the stream key for a label set.
///
/// Keys are sorted before concatenation as `key=value;`, so two label sets
/// with the same pairs always produce the same key regardless of map iteration
/// order. `\`, `=` and `;` inside keys and values are backslash-escaped so
/// distinct label sets never collide. An empty label set yields `""`.
pub fn stream_key(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(&String, &String)> = labels.iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut buf = pool::acquire();
    for (key, value) in pairs {
        push_escaped(&mut buf, key);
        buf.push(b'=');
        push_escaped(&mut buf, value);
        buf.push(b';');
    }

    String::from_utf8_lossy(&buf).into_owned()
}

fn push_escaped(buf: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        if matches!(b, b'\\' | b'=' | b';') {
            buf.push(b'\\');
        }
        buf.push(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_labels() {
        assert_eq!(stream_key(&Labels::new()), "");
    }

    #[test]
    fn test_single_label() {
        assert_eq!(stream_key(&labels(&[("env", "prod")])), "env=prod;");
    }

    #[test]
    fn test_keys_sorted() {
        let key = stream_key(&labels(&[("env", "prod"), ("app", "myapp"), ("region", "us-east")]));
        assert_eq!(key, "app=myapp;env=prod;region=us-east;");
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let mut a = Labels::new();
        a.insert("a".into(), "1".into());
        a.insert("b".into(), "2".into());
        a.insert("c".into(), "3".into());

        let mut b = Labels::new();
        b.insert("c".into(), "3".into());
        b.insert("a".into(), "1".into());
        b.insert("b".into(), "2".into());

        assert_eq!(stream_key(&a), stream_key(&b));
    }

    #[test]
    fn test_different_sets_differ() {
        let base = stream_key(&labels(&[("app", "x")]));
        assert_ne!(base, stream_key(&labels(&[("app", "y")])));
        assert_ne!(base, stream_key(&labels(&[("app", "x"), ("env", "prod")])));
        assert_ne!(base, stream_key(&Labels::new()));
    }

    #[test]
    fn test_separators_do_not_collide() {
        let a = stream_key(&labels(&[("a", "1;b=2")]));
        let b = stream_key(&labels(&[("a", "1"), ("b", "2")]));
        assert_ne!(a, b);
    }
}
