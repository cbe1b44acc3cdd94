use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// An ordered, immutable series of observations shared between the caller
/// and the sampling worker.
pub type Dataset = Arc<[Arc<Observation>]>;

// Observation is a single station reading: a timestamp plus named fields.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Observation {
    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Observation {
    pub fn new(timestamp: SystemTime) -> Self {
        Observation {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Finite numeric value of `key`, or `None` if it is missing, null,
    /// NaN, infinite or not a number. Numeric strings are accepted.
    pub fn value(&self, key: &str) -> Option<f64> {
        let v = match self.fields.get(key)? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if v.is_finite() {
            Some(v)
        } else {
            None
        }
    }
}

/// Anything the sampler can read a named numeric value from.
pub trait Valued {
    fn value(&self, key: &str) -> Option<f64>;
}

impl Valued for Observation {
    fn value(&self, key: &str) -> Option<f64> {
        Observation::value(self, key)
    }
}

impl<T: Valued + ?Sized> Valued for Arc<T> {
    fn value(&self, key: &str) -> Option<f64> {
        (**self).value(key)
    }
}

impl<T: Valued + ?Sized> Valued for &T {
    fn value(&self, key: &str) -> Option<f64> {
        (**self).value(key)
    }
}

#[async_trait]
pub trait Codec {
    async fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        obs: &Observation,
    ) -> Result<()>;
    async fn decode<R: AsyncBufRead + Unpin + Send>(&self, reader: &mut R) -> Result<Observation>;
}

// JsonCodec reads and writes newline delimited JSON records.
pub struct JsonCodec;

#[async_trait]
impl Codec for JsonCodec {
    async fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        obs: &Observation,
    ) -> Result<()> {
        writer.write_all(&serde_json::to_vec(obs)?).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn decode<R: AsyncBufRead + Unpin + Send>(&self, reader: &mut R) -> Result<Observation> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                eyre::bail!("EOF");
            }
            if !buf.iter().all(u8::is_ascii_whitespace) {
                break;
            }
        }
        serde_json::from_slice(&buf).map_err(|e| eyre::eyre!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::BufReader;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn value_reads_numbers_and_numeric_strings() {
        let obs = Observation::new(at(0))
            .with_field("temperature", -3.5)
            .with_field("snow_depth", "12.25")
            .with_field("station", "Alpine Meadow");
        assert_eq!(obs.value("temperature"), Some(-3.5));
        assert_eq!(obs.value("snow_depth"), Some(12.25));
        assert_eq!(obs.value("station"), None);
        assert_eq!(obs.value("missing"), None);
    }

    #[test]
    fn value_rejects_null_nan_and_non_scalars() {
        let obs = Observation::new(at(0))
            .with_field("null", Value::Null)
            .with_field("nan", "NaN")
            .with_field("flag", true)
            .with_field("list", json!([1, 2]));
        assert_eq!(obs.value("null"), None);
        assert_eq!(obs.value("nan"), None);
        assert_eq!(obs.value("flag"), None);
        assert_eq!(obs.value("list"), None);
    }

    #[test]
    fn value_rejects_infinities() {
        let obs = Observation::new(at(0))
            .with_field("a", "inf")
            .with_field("b", "1e400")
            .with_field("c", "-Infinity")
            .with_field("d", "1e300");
        assert_eq!(obs.value("a"), None);
        assert_eq!(obs.value("b"), None);
        assert_eq!(obs.value("c"), None);
        assert_eq!(obs.value("d"), Some(1e300));
    }

    #[test]
    fn valued_through_arc_and_ref() {
        let obs = Arc::new(Observation::new(at(0)).with_field("wind_speed", 4));
        assert_eq!(Valued::value(&obs, "wind_speed"), Some(4.0));
        assert_eq!(Valued::value(&&*obs, "wind_speed"), Some(4.0));
    }

    #[tokio::test]
    async fn json_decode_flattens_fields() {
        let input = b"{\"timestamp\":\"2024-01-15T06:00:00Z\",\"temperature\":1.5,\"precipitation\":null}\n" as &[u8];
        let mut reader = BufReader::new(input);
        let obs = JsonCodec.decode(&mut reader).await.unwrap();
        assert_eq!(obs.value("temperature"), Some(1.5));
        assert_eq!(obs.fields.get("precipitation"), Some(&Value::Null));
        assert!(obs.timestamp > SystemTime::UNIX_EPOCH);
        assert!(JsonCodec.decode(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn json_decode_skips_blank_lines() {
        let input = b"\n\n{\"timestamp\":\"2024-01-15T06:00:00Z\",\"v\":2}\n" as &[u8];
        let mut reader = BufReader::new(input);
        let obs = JsonCodec.decode(&mut reader).await.unwrap();
        assert_eq!(obs.value("v"), Some(2.0));
    }

    #[tokio::test]
    async fn json_encode_then_decode() {
        let obs = Observation::new(at(1_700_000_000)).with_field("temperature", 7.25);
        let mut buf = Vec::new();
        JsonCodec.encode(&mut buf, &obs).await.unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut reader = BufReader::new(buf.as_slice());
        assert_eq!(JsonCodec.decode(&mut reader).await.unwrap(), obs);
    }
}
