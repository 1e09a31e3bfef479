//! Channel registry: one [`Channel`] per configured channel name.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Channel, ChannelError};
use crate::config::ServerConfig;

/// All channels the server can hand to sessions, keyed by name.
pub struct ChannelRegistry {
    channels: BTreeMap<String, Arc<Channel>>,
}

impl ChannelRegistry {
    /// Instantiates every configured channel. Any channel failing to come
    /// up (missing directory, watch failure) is fatal at startup.
    pub fn new(config: &ServerConfig) -> Result<Self, ChannelError> {
        let mut channels = BTreeMap::new();
        for name in &config.channels {
            // validated by ServerConfig::load
            let channel_config = &config.channel_configs[name];
            let channel = Channel::new(name, channel_config, &config.media_dir)?;
            channels.insert(name.clone(), channel);
        }
        Ok(Self { channels })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.get(name)
    }

    /// Channel names in sorted order, as announced in `server-hello`.
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::{channel_config, make_media_tree};

    #[test]
    fn builds_channels_and_looks_up_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = channel_config();
        make_media_tree(dir.path(), "abc", &config);
        make_media_tree(dir.path(), "xyz", &config);

        let server_config = ServerConfig {
            media_dir: dir.path().to_path_buf(),
            channels: vec!["abc".to_string(), "xyz".to_string()],
            channel_configs: [
                ("abc".to_string(), config.clone()),
                ("xyz".to_string(), config),
            ]
            .into_iter()
            .collect(),
            ws_base_port: 50000,
            abr: "linear_bba".to_string(),
            abr_config: Default::default(),
            idle_timeout_s: 10,
            send_high_watermark: 2 << 20,
            send_max: 16 << 20,
        };

        let registry = ChannelRegistry::new(&server_config).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["abc", "xyz"]);
        assert!(registry.get("abc").is_some());
        assert!(registry.get("nope").is_none());
    }
}
