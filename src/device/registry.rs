//! Device registry
//!
//! Process-wide table of device factories. Platform integrations register a
//! factory per decoder family; engines look one up by MIME type.

use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::{DeviceBinding, DeviceError};
use crate::media::Codec;

/// Creates bindings for one decoder family
pub trait DeviceFactory: Send + Sync {
    /// Component name of the decoders this factory creates
    fn name(&self) -> &str;

    fn supports(&self, mime: &str) -> bool;

    /// Availability check, run once per factory
    fn probe(&self) -> bool {
        true
    }

    fn create(&self) -> Result<Arc<dyn DeviceBinding>, DeviceError>;
}

struct Entry {
    factory: Arc<dyn DeviceFactory>,
    available: Option<bool>,
}

static FACTORIES: Lazy<RwLock<Vec<Entry>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Cached result of the first registry initialization
static INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Probe every registered factory. Runs once per process; later calls
/// return the cached result.
pub fn init() -> bool {
    *INITIALIZED.get_or_init(|| {
        let mut entries = FACTORIES.write();
        for entry in entries.iter_mut() {
            if entry.available.is_none() {
                entry.available = Some(probe(entry.factory.as_ref()));
            }
        }
        let available = entries.iter().filter(|e| e.available == Some(true)).count();
        info!(
            "Device registry initialized: {} of {} factories available",
            available,
            entries.len()
        );
        available > 0
    })
}

fn probe(factory: &dyn DeviceFactory) -> bool {
    let ok = factory.probe();
    if ok {
        debug!("Decoder factory {} available", factory.name());
    } else {
        warn!("Decoder factory {} failed its probe, skipping", factory.name());
    }
    ok
}

/// Add a factory, replacing any factory with the same name.
/// Factories registered after `init` are probed immediately.
pub fn register(factory: Arc<dyn DeviceFactory>) {
    let available = INITIALIZED.get().map(|_| probe(factory.as_ref()));
    let mut entries = FACTORIES.write();
    entries.retain(|e| e.factory.name() != factory.name());
    info!("Registered decoder factory {}", factory.name());
    entries.push(Entry { factory, available });
}

pub fn unregister(name: &str) -> bool {
    let mut entries = FACTORIES.write();
    let before = entries.len();
    entries.retain(|e| e.factory.name() != name);
    entries.len() != before
}

/// First available factory handling `mime`, in registration order
pub fn find_decoder(mime: &str) -> Option<Arc<dyn DeviceFactory>> {
    init();
    let mut entries = FACTORIES.write();
    for entry in entries.iter_mut() {
        if !entry.factory.supports(mime) {
            continue;
        }
        let factory = entry.factory.clone();
        if *entry.available.get_or_insert_with(|| probe(factory.as_ref())) {
            return Some(factory);
        }
    }
    None
}

/// Create a binding for `codec`
pub fn create_decoder(codec: Codec) -> Result<Arc<dyn DeviceBinding>, DeviceError> {
    let factory = find_decoder(codec.mime())
        .ok_or_else(|| DeviceError::Unavailable(codec.mime().to_string()))?;
    debug!("Using decoder {} for {}", factory.name(), codec.mime());
    factory.create()
}

pub fn registered_names() -> Vec<String> {
    FACTORIES
        .read()
        .iter()
        .map(|e| e.factory.name().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{LoopbackConfig, LoopbackFactory};

    struct BrokenFactory;

    impl DeviceFactory for BrokenFactory {
        fn name(&self) -> &str {
            "test.registry.broken"
        }
        fn supports(&self, mime: &str) -> bool {
            mime == "video/x-registry-test"
        }
        fn probe(&self) -> bool {
            false
        }
        fn create(&self) -> Result<Arc<dyn DeviceBinding>, DeviceError> {
            Err(DeviceError::Failure("unreachable".into()))
        }
    }

    #[test]
    fn test_find_skips_unavailable() {
        register(Arc::new(BrokenFactory));
        assert!(find_decoder("video/x-registry-test").is_none());

        register(Arc::new(LoopbackFactory::new(
            "test.registry.loopback",
            &["video/x-registry-test"],
            LoopbackConfig::default(),
        )));
        let found = find_decoder("video/x-registry-test").unwrap();
        assert_eq!(found.name(), "test.registry.loopback");
        assert!(registered_names().iter().any(|n| n == "test.registry.broken"));

        assert!(unregister("test.registry.loopback"));
        assert!(unregister("test.registry.broken"));
        assert!(!unregister("test.registry.broken"));
    }

    #[test]
    fn test_create_decoder_by_codec() {
        register(Arc::new(LoopbackFactory::new(
            "test.registry.vp9",
            &["video/x-vnd.on2.vp9"],
            LoopbackConfig::default(),
        )));
        let device = create_decoder(Codec::Vp9).unwrap();
        assert_eq!(device.name(), "test.registry.vp9");
        unregister("test.registry.vp9");
    }

    #[test]
    fn test_unknown_mime() {
        assert!(matches!(
            create_decoder(Codec::Gsm),
            Err(DeviceError::Unavailable(_))
        ));
    }
}
