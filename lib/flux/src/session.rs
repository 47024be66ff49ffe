/// A symmetric key carrier used for pre-shared signing/authentication secrets (e.g. the key a
/// gateway and its authenticate backend share out of band). Distinct from the per-connection
/// AES key negotiated during the handshake, which lives on the connection context instead.
pub mod server {
    use crate::encoding::base64;
    use serde_derive::{Deserialize, Serialize};
    use std::ops::{Deref, DerefMut};

    const SESSION_KEY_SIZE: usize = 32;

    #[derive(Serialize, Deserialize, Clone)]
    pub struct SessionKey(
        #[serde(
            serialize_with = "base64::serialize",
            deserialize_with = "base64::deserialize_array"
        )]
        [u8; SESSION_KEY_SIZE],
    );

    impl SessionKey {
        pub const SIZE: usize = SESSION_KEY_SIZE;

        #[inline]
        pub fn new(key: [u8; Self::SIZE]) -> SessionKey {
            SessionKey(key)
        }
    }

    impl Deref for SessionKey {
        type Target = [u8; SessionKey::SIZE];

        #[inline]
        fn deref(&self) -> &[u8; SessionKey::SIZE] {
            &self.0
        }
    }

    impl DerefMut for SessionKey {
        #[inline]
        fn deref_mut(&mut self) -> &mut [u8; SessionKey::SIZE] {
            &mut self.0
        }
    }
}
