//! Bridge between engine units and the `kelp-unit` binary format.
//!
//! Compiled scripts and modules are written with bytecode allowed and no
//! shared buffers; worker messages are written the other way round.
//! Deserialized modules are registered with the loader and linked before
//! anything can run them.

use std::rc::Rc;

use kelp_unit::{ReadOptions, WriteOptions};
use tracing::debug;

use crate::engine::{Engine, EngineResult, NativeFunction, Unit};
use crate::error::{RuntimeError, RuntimeResult};
use crate::message_pipe::Message;
use crate::module_loader;
use crate::runtime::Runtime;
use crate::shared_buffer::SharedBuffer;

/// Serialize a unit, returning the blob and the shared buffers it references
pub fn serialize_unit<E: Engine>(
    engine: &mut E,
    unit: &Unit<E>,
    options: &WriteOptions,
) -> RuntimeResult<(Vec<u8>, Vec<SharedBuffer>)> {
    let mut shared = Vec::new();
    let value = engine.write_unit(unit, &mut shared)?;
    let bytes = kelp_unit::serialize(&value, options)?;
    Ok((bytes, shared))
}

/// Deserialize a blob; `shared` backs its shared buffer references
pub fn deserialize_unit<E: Engine>(
    engine: &mut E,
    bytes: &[u8],
    shared: &[SharedBuffer],
    options: &ReadOptions,
) -> RuntimeResult<Unit<E>> {
    let value = kelp_unit::deserialize(bytes, options)?;
    Ok(engine.read_unit(value, shared)?)
}

/// Serialize a plain value for another thread.
///
/// Every shared buffer in the value gets one extra reference that travels
/// with the message.
pub fn encode_message<E: Engine>(engine: &mut E, value: &E::Value) -> RuntimeResult<Message> {
    let (data, shared) =
        serialize_unit(engine, &Unit::Value(value.clone()), &WriteOptions::message())?;
    Ok(Message::new(data, shared))
}

/// Rebuild a value received from another thread.
///
/// The message's own shared buffer references are released when it drops.
pub fn decode_message<E: Engine>(engine: &mut E, message: Message) -> RuntimeResult<E::Value> {
    let count = u32::try_from(message.shared.len())
        .map_err(|_| RuntimeError::worker("too many shared buffers in message"))?;
    let unit = deserialize_unit(
        engine,
        &message.data,
        &message.shared,
        &ReadOptions::message(count),
    )?;
    match unit {
        Unit::Value(value) => Ok(value),
        Unit::Script(_) | Unit::Module(_) => Err(RuntimeError::Type(
            "message does not contain a plain value".to_string(),
        )),
    }
}

impl<E: Engine> Runtime<E> {
    /// Serialize a compiled script or module, optionally in the opposite byte
    /// order of the host
    pub fn write_object(&mut self, unit: &Unit<E>, byte_swap: bool) -> RuntimeResult<Vec<u8>> {
        let options = WriteOptions::bytecode().byte_swap(byte_swap);
        let (bytes, _shared) = serialize_unit(&mut self.engine, unit, &options)?;
        Ok(bytes)
    }

    /// Deserialize a compiled unit.
    ///
    /// Modules get their `import.meta` and are linked, so the returned unit
    /// can run immediately.
    pub fn read_object(&mut self, bytes: &[u8]) -> RuntimeResult<Unit<E>> {
        let unit = deserialize_unit(&mut self.engine, bytes, &[], &ReadOptions::bytecode())?;
        if let Unit::Module(module) = &unit {
            let name = self.engine.module_name(module);
            let loader = &self.state.loader;
            let record = loader.register(&mut self.engine, &name, module.clone())?;
            loader.link(&mut self.engine, &record)?;
        }
        Ok(unit)
    }

    /// Wrap a unit in a zero-argument function: calling it runs a script, or
    /// evaluates a module and returns its evaluation promise
    pub fn bind_callable(&mut self, unit: Unit<E>) -> RuntimeResult<E::Value> {
        let state = Rc::downgrade(&self.state);
        let run: NativeFunction<E> =
            Rc::new(move |engine: &mut E, _args: &[E::Value]| -> EngineResult<E::Value> {
                match &unit {
                    Unit::Module(module) => {
                        let state = module_loader::upgrade(&state, engine)?;
                        let name = engine.module_name(module);
                        let loader = &state.loader;
                        let record = match loader.get(&name) {
                            Some(record) => record,
                            None => loader
                                .register(engine, &name, module.clone())
                                .map_err(|e| e.throw_into(engine))?,
                        };
                        loader
                            .link(engine, &record)
                            .and_then(|()| loader.evaluate(engine, &record))
                            .map_err(|e| e.throw_into(engine))
                    }
                    other => engine.run(other.clone()),
                }
            });
        Ok(self.engine.new_function("", 0, run)?)
    }

    /// Load a serialized unit and, unless `load_only`, run it.
    ///
    /// Returns the script's completion value or the module's evaluation
    /// promise; `None` when only loading.
    pub fn eval_binary(&mut self, bytes: &[u8], load_only: bool) -> RuntimeResult<Option<E::Value>> {
        let _interrupt = self.state.interrupt.enter();
        let unit = self.read_object(bytes)?;
        debug!(len = bytes.len(), load_only, "binary unit loaded");
        if load_only {
            return Ok(None);
        }

        let value = match unit {
            Unit::Module(module) => {
                let name = self.engine.module_name(&module);
                let record = self
                    .state
                    .loader
                    .get(&name)
                    .ok_or_else(|| RuntimeError::load(&name, "module was not registered"))?;
                let promise = self.state.loader.evaluate(&mut self.engine, &record)?;
                self.settle_evaluation(promise)?
            }
            other => self.engine.run(other)?,
        };
        Ok(Some(value))
    }
}
