//! Payload encryption hooks of the command channel.
//!
//! Both directions default to a plain copy, so a device without a cipher
//! speaks clear JSON.

use std::fmt;

pub type Transform = Box<dyn Fn(&[u8]) -> Vec<u8>>;

#[derive(Default)]
pub struct Codec {
    encrypt: Option<Transform>,
    decrypt: Option<Transform>,
}

impl Codec {
    pub fn new(encrypt: Option<Transform>, decrypt: Option<Transform>) -> Self {
        Self { encrypt, decrypt }
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        match &self.encrypt {
            Some(f) => f(plain),
            None => plain.to_vec(),
        }
    }

    pub fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        match &self.decrypt {
            Some(f) => f(cipher),
            None => cipher.to_vec(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.encrypt.is_none() && self.decrypt.is_none()
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("encrypt", &self.encrypt.is_some())
            .field("decrypt", &self.decrypt.is_some())
            .finish()
    }
}
