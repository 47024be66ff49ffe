/// Base64 serde helpers for fixed-size byte arrays, matching the "base64 encoder selector"
/// config knob the gateway exposes (spec §6): wire payloads are base64 only when the
/// configured encoder asks for it, but on-disk tokens and config fields always are.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&::base64::encode(bytes))
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(s)
    }

    /// Deserialize into a fixed-size array, zero-padding (and truncating) to `N`.
    pub fn deserialize_array<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        let decoded = decode(s).map_err(de::Error::custom)?;
        let mut out = [0u8; N];
        let len = decoded.len().min(N);
        out[..len].copy_from_slice(&decoded[..len]);
        Ok(out)
    }

    /// Deserialize into an owned `Vec<u8>`.
    pub fn deserialize_vec<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        decode(s).map_err(de::Error::custom)
    }
}
