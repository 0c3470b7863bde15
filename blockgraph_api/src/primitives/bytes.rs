use std::{fmt::Display, num::ParseIntError, str::FromStr};

/// Unit suffixes accepted in human readable sizes, with their shift.
const SUFFIXES: [(char, u32); 4] = [('K', 10), ('M', 20), ('G', 30), ('T', 40)];

/// A size in bytes that reads and writes as a human readable value ("512M",
/// "1G") whenever it is a whole multiple of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount(pub u64);

impl From<u64> for ByteCount {
    fn from(x: u64) -> Self {
        ByteCount(x)
    }
}

impl From<ByteCount> for u64 {
    fn from(x: ByteCount) -> Self {
        x.0
    }
}

impl ByteCount {
    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn to_human_readable(&self) -> String {
        if self.0 == 0 {
            return "0".to_owned();
        }

        SUFFIXES
            .iter()
            .rev()
            .find(|(_, shift)| self.0.trailing_zeros() >= *shift)
            .map(|(suffix, shift)| format!("{}{suffix}", self.0 >> shift))
            .unwrap_or_else(|| self.0.to_string())
    }

    pub fn from_human_readable(s: &str) -> Result<Self, ParseIntError> {
        let s = s.trim();
        let (digits, shift) = SUFFIXES
            .iter()
            .find_map(|(suffix, shift)| s.strip_suffix(*suffix).map(|p| (p, *shift)))
            .unwrap_or((s, 0));

        Ok(Self(digits.trim().parse::<u64>()? << shift))
    }
}

impl Display for ByteCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

impl FromStr for ByteCount {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_human_readable(s)
    }
}

impl<'de> serde::Deserialize<'de> for ByteCount {
    fn deserialize<D>(deserializer: D) -> Result<ByteCount, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // YAML turns a bare "1024" into a number, so both shapes are accepted.
        match serde_yaml::Value::deserialize(deserializer)? {
            serde_yaml::Value::String(s) => ByteCount::from_str(s.as_str())
                .map_err(|e| serde::de::Error::custom(format!("invalid byte count: {e}"))),
            serde_yaml::Value::Number(n) => n.as_u64().map(ByteCount).ok_or_else(|| {
                serde::de::Error::custom("invalid byte count, expected unsigned integer")
            }),
            _ => Err(serde::de::Error::custom("invalid byte count")),
        }
    }
}

impl serde::Serialize for ByteCount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.0 & 0x3FF != 0 {
            serializer.serialize_u64(self.0)
        } else {
            serializer.serialize_str(self.to_human_readable().as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_string() {
        assert_eq!(ByteCount::from_str("1").unwrap(), ByteCount(1));
        assert_eq!(ByteCount::from_str("20K").unwrap(), ByteCount(20 << 10));
        assert_eq!(ByteCount::from_str("30M").unwrap(), ByteCount(30 << 20));
        assert_eq!(ByteCount::from_str("40G").unwrap(), ByteCount(40 << 30));
        assert_eq!(ByteCount::from_str("50T").unwrap(), ByteCount(50 << 40));
        assert_eq!(ByteCount::from_str(" 300 K ").unwrap(), ByteCount(300 << 10));

        assert!(ByteCount::from_str("1.0K").is_err());
        assert!(ByteCount::from_str("1 0K").is_err());
        assert!(ByteCount::from_str("1X").is_err());
        assert!(ByteCount::from_str("X10K").is_err());
        assert!(ByteCount::from_str("").is_err());
    }

    #[test]
    fn test_to_human_readable() {
        assert_eq!(ByteCount(0).to_string(), "0");
        assert_eq!(ByteCount(1023).to_string(), "1023");
        assert_eq!(ByteCount(1024).to_string(), "1K");
        assert_eq!(ByteCount(1025).to_string(), "1025");
        assert_eq!(ByteCount(1024 * 1024 + 1024).to_string(), "1025K");
        assert_eq!(ByteCount(16 << 20).to_string(), "16M");
        assert_eq!(ByteCount(3 << 30).to_string(), "3G");
        assert_eq!(ByteCount(1 << 40).to_string(), "1T");
    }

    #[test]
    fn test_yaml() {
        #[derive(Debug, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
        struct Sized {
            size: ByteCount,
        }

        let cases = [
            ("size: 512", 512, "size: 512"),
            ("size: 1024", 1024, "size: 1K"),
            ("size: 16M", 16 << 20, "size: 16M"),
            ("size: 1024M", 1 << 30, "size: 1G"),
        ];

        for (input, bytes, output) in cases {
            let parsed: Sized = serde_yaml::from_str(input).unwrap();
            assert_eq!(parsed.size, ByteCount(bytes), "failed to parse '{input}'");
            assert_eq!(serde_yaml::to_string(&parsed).unwrap().trim(), output);
        }

        assert!(serde_yaml::from_str::<Sized>("size: [1]").is_err());
    }
}
