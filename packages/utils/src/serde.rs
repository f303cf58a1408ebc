use std::fmt;

use serde::{de, Deserializer};

/// Accepts either a comma-separated string (env vars, cli) or a proper
/// sequence (toml) for `Vec<String>` fields.
pub fn deserialize_vec_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> de::Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a comma-separated string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Vec<String>, E>
        where
            E: de::Error,
        {
            Ok(value.split(',').map(|s| s.trim().to_string()).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Vec<String>, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(elem) = seq.next_element()? {
                vec.push(elem);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "deserialize_vec_string")]
        values: Vec<String>,
    }

    #[test]
    fn comma_separated_string() {
        let w: Wrapper = serde_json::from_str(r#"{"values": "a, b,c"}"#).unwrap();
        assert_eq!(w.values, vec!["a", "b", "c"]);
    }

    #[test]
    fn proper_sequence() {
        let w: Wrapper = serde_json::from_str(r#"{"values": ["a", "b"]}"#).unwrap();
        assert_eq!(w.values, vec!["a", "b"]);
    }
}
