//! Registered factories for in-process clients and drivers.
//!
//! Plug-ins are not loaded from shared objects; they are plain
//! constructors registered by name in a process-wide table, usually from
//! `main` before the engine starts. A connect request naming a factory
//! gets its product instantiated inline, with the engine handle and the
//! freshly assigned client id in hand so the constructor can register
//! ports right away.

use crate::client::InProcessClient;
use crate::driver::Driver;
use crate::engine::Engine;
use crate::ClientId;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("no factory registered under {0:?}")]
    UnknownFactory(String),
    #[error("factory {0:?} failed to initialize: {1}")]
    Init(String, String),
}

/// Builds one in-process client. `args` is the opaque string from the
/// connect request.
pub type InProcessCtor =
    fn(engine: &Arc<Engine>, client: ClientId, args: &str) -> Result<Box<dyn InProcessClient>, FactoryError>;

/// Builds one driver from its argument string.
pub type DriverCtor = fn(args: &str) -> Result<Box<dyn Driver>, FactoryError>;

struct Tables {
    in_process: BTreeMap<String, InProcessCtor>,
    drivers: BTreeMap<String, DriverCtor>,
}

fn tables() -> &'static RwLock<Tables> {
    static TABLES: OnceLock<RwLock<Tables>> = OnceLock::new();
    TABLES.get_or_init(|| {
        RwLock::new(Tables {
            in_process: BTreeMap::new(),
            drivers: BTreeMap::new(),
        })
    })
}

/// Register an in-process client constructor. Last registration under a
/// name wins.
pub fn register_in_process(name: &str, ctor: InProcessCtor) {
    tables()
        .write()
        .unwrap()
        .in_process
        .insert(name.to_string(), ctor);
}

pub fn register_driver(name: &str, ctor: DriverCtor) {
    tables()
        .write()
        .unwrap()
        .drivers
        .insert(name.to_string(), ctor);
}

/// Instantiate an in-process client from its registered factory.
pub fn make_in_process(
    name: &str,
    engine: &Arc<Engine>,
    client: ClientId,
    args: &str,
) -> Result<Box<dyn InProcessClient>, FactoryError> {
    let ctor = tables()
        .read()
        .unwrap()
        .in_process
        .get(name)
        .copied()
        .ok_or_else(|| FactoryError::UnknownFactory(name.to_string()))?;
    ctor(engine, client, args)
}

pub fn make_driver(name: &str, args: &str) -> Result<Box<dyn Driver>, FactoryError> {
    let ctor = tables()
        .read()
        .unwrap()
        .drivers
        .get(name)
        .copied()
        .ok_or_else(|| FactoryError::UnknownFactory(name.to_string()))?;
    ctor(args)
}

/// Names currently registered, for diagnostics.
pub fn registered_in_process() -> Vec<String> {
    tables().read().unwrap().in_process.keys().cloned().collect()
}

pub fn registered_drivers() -> Vec<String> {
    tables().read().unwrap().drivers.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_ctor(
        _engine: &Arc<Engine>,
        _client: ClientId,
        _args: &str,
    ) -> Result<Box<dyn InProcessClient>, FactoryError> {
        struct Silent;
        impl InProcessClient for Silent {}
        Ok(Box::new(Silent))
    }

    #[test]
    fn test_unknown_factory() {
        let err = tables()
            .read()
            .unwrap()
            .in_process
            .get("no-such-factory")
            .copied();
        assert!(err.is_none());
    }

    #[test]
    fn test_register_and_list() {
        register_in_process("test-silent", silent_ctor);
        assert!(registered_in_process().contains(&"test-silent".to_string()));
    }

    fn metro_ctor(
        engine: &Arc<Engine>,
        client: ClientId,
        _args: &str,
    ) -> Result<Box<dyn InProcessClient>, FactoryError> {
        struct Metro;
        impl InProcessClient for Metro {}
        engine
            .port_register(
                client,
                "metro:out",
                crate::buffer::AUDIO_PORT_TYPE,
                crate::control::PORT_IS_OUTPUT,
            )
            .map_err(|e| FactoryError::Init("metro".into(), e.to_string()))?;
        Ok(Box::new(Metro))
    }

    #[test]
    fn test_load_in_process_through_factory() {
        register_in_process("metro", metro_ctor);
        let (_dirs, engine) = crate::testing::test_engine(|cfg| cfg);
        engine.set_buffer_size(64).unwrap();

        // the constructor runs with the client installed, so it can
        // register ports immediately
        let id = engine.load_in_process("metro-1", "metro", "").unwrap();
        assert!(engine.graph().client_by_id(id).unwrap().plugin.is_some());
        assert!(crate::port::find_by_name(engine.control(), "metro:out").is_some());

        // a missing factory fails the whole setup and leaves no record
        let err = engine.load_in_process("ghost", "no-such-factory", "");
        assert!(err.is_err());
        assert!(engine.graph().client_by_name("ghost").is_none());

        engine.shutdown();
    }
}
