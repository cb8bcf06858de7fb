//! Combined configuration of a cache server and its clients.

use serde::{Deserialize, Serialize};

use aotc_client::DeserializerConfig;
use aotc_error::Result;
use aotc_store::StoreConfig;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AotcConfig {
    pub store: StoreConfig,
    pub deserializer: DeserializerConfig,
}

impl AotcConfig {
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.deserializer.validate()
    }
}
