//! Unit serialization

use crate::error::{UnitError, UnitResult};
use crate::value::{FunctionUnit, ModuleUnit, UnitValue};
use crate::{
    ByteOrder, Capabilities, Capability, MAX_DEPTH, UNIT_MAGIC, UNIT_VERSION, WriteOptions,
};

pub(crate) mod tag {
    pub const UNDEFINED: u8 = 0x00;
    pub const NULL: u8 = 0x01;
    pub const FALSE: u8 = 0x02;
    pub const TRUE: u8 = 0x03;
    pub const INT32: u8 = 0x04;
    pub const FLOAT64: u8 = 0x05;
    pub const STRING: u8 = 0x06;
    pub const ARRAY: u8 = 0x07;
    pub const OBJECT: u8 = 0x08;
    pub const ARRAY_BUFFER: u8 = 0x09;
    pub const SHARED_BUFFER: u8 = 0x0a;
    pub const FUNCTION: u8 = 0x0b;
    pub const MODULE: u8 = 0x0c;
    pub const REFERENCE: u8 = 0x0d;
}

/// Serialize a value tree into a self-describing blob.
///
/// Fails with [`UnitError::NotAllowed`] when the tree contains a construct not
/// enabled in `options`; nothing partial is returned in that case.
pub fn serialize(value: &UnitValue, options: &WriteOptions) -> UnitResult<Vec<u8>> {
    let mut writer = Writer::new(options);
    writer.value(value, 0)?;
    Ok(writer.finish())
}

struct Writer {
    buf: Vec<u8>,
    order: ByteOrder,
    allow: Capabilities,
    used: Capabilities,
    objects: u32,
}

impl Writer {
    fn new(options: &WriteOptions) -> Self {
        let order = options.byte_order();
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&UNIT_MAGIC);
        buf.push(UNIT_VERSION);
        buf.push(order.marker());
        // capability byte, patched in finish()
        buf.push(0);
        buf.push(0);
        Self {
            buf,
            order,
            allow: options.allow,
            used: Capabilities::NONE,
            objects: 0,
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf[6] = self.used.bits();
        self.buf
    }

    fn require(&mut self, capability: Capability) -> UnitResult<()> {
        if !self.allow.contains(capability) {
            return Err(UnitError::NotAllowed(capability));
        }
        self.used = self.used.with(capability);
        Ok(())
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        let bytes = match self.order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    fn u32(&mut self, v: u32) {
        let bytes = match self.order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    fn u64(&mut self, v: u64) {
        let bytes = match self.order {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        self.buf.extend_from_slice(&bytes);
    }

    fn len(&mut self, len: usize) -> UnitResult<()> {
        let len = u32::try_from(len).map_err(|_| UnitError::LengthOverflow(len))?;
        self.u32(len);
        Ok(())
    }

    fn bytes(&mut self, data: &[u8]) -> UnitResult<()> {
        self.len(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn str(&mut self, s: &str) -> UnitResult<()> {
        self.bytes(s.as_bytes())
    }

    fn value(&mut self, value: &UnitValue, depth: usize) -> UnitResult<()> {
        if depth > MAX_DEPTH {
            return Err(UnitError::TooDeep(MAX_DEPTH));
        }
        if value.is_object() {
            self.objects += 1;
        }

        match value {
            UnitValue::Undefined => self.u8(tag::UNDEFINED),
            UnitValue::Null => self.u8(tag::NULL),
            UnitValue::Bool(false) => self.u8(tag::FALSE),
            UnitValue::Bool(true) => self.u8(tag::TRUE),
            UnitValue::Int32(n) => {
                self.u8(tag::INT32);
                self.u32(*n as u32);
            }
            UnitValue::Float64(n) => {
                self.u8(tag::FLOAT64);
                self.u64(n.to_bits());
            }
            UnitValue::String(s) => {
                self.u8(tag::STRING);
                self.str(s)?;
            }
            UnitValue::Array(items) => {
                self.u8(tag::ARRAY);
                self.len(items.len())?;
                for item in items {
                    self.value(item, depth + 1)?;
                }
            }
            UnitValue::Object(props) => {
                self.u8(tag::OBJECT);
                self.len(props.len())?;
                for (key, item) in props {
                    self.str(key)?;
                    self.value(item, depth + 1)?;
                }
            }
            UnitValue::ArrayBuffer(data) => {
                self.u8(tag::ARRAY_BUFFER);
                self.bytes(data)?;
            }
            UnitValue::SharedBuffer(index) => {
                self.require(Capability::SharedBuffer)?;
                self.u8(tag::SHARED_BUFFER);
                self.u32(*index);
            }
            UnitValue::Function(func) => {
                self.require(Capability::Bytecode)?;
                self.u8(tag::FUNCTION);
                self.function(func, depth)?;
            }
            UnitValue::Module(module) => {
                self.require(Capability::Bytecode)?;
                self.u8(tag::MODULE);
                self.module(module, depth)?;
            }
            UnitValue::Reference(index) => {
                self.require(Capability::Reference)?;
                if *index >= self.objects {
                    return Err(UnitError::InvalidReference {
                        index: *index,
                        available: self.objects,
                    });
                }
                self.u8(tag::REFERENCE);
                self.u32(*index);
            }
        }
        Ok(())
    }

    fn function(&mut self, func: &FunctionUnit, depth: usize) -> UnitResult<()> {
        self.str(&func.name)?;
        self.str(&func.filename)?;
        self.u16(func.arg_count);
        self.bytes(&func.bytecode)?;
        self.len(func.constants.len())?;
        for constant in &func.constants {
            self.value(constant, depth + 1)?;
        }
        Ok(())
    }

    fn module(&mut self, module: &ModuleUnit, depth: usize) -> UnitResult<()> {
        self.str(&module.name)?;
        self.len(module.requests.len())?;
        for request in &module.requests {
            self.str(request)?;
        }
        self.len(module.exports.len())?;
        for export in &module.exports {
            self.str(export)?;
        }
        self.u8(module.has_top_level_await as u8);
        self.function(&module.body, depth)
    }
}
