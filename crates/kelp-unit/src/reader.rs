//! Unit deserialization

use crate::error::{UnitError, UnitResult};
use crate::value::{FunctionUnit, ModuleUnit, UnitValue};
use crate::writer::tag;
use crate::{
    ByteOrder, Capabilities, Capability, HEADER_LEN, MAX_DEPTH, ReadOptions, UNIT_MAGIC,
    UNIT_VERSION, UnitHeader,
};

/// Decode and validate the fixed header of a blob
pub fn read_header(bytes: &[u8]) -> UnitResult<UnitHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(UnitError::UnexpectedEnd {
            offset: bytes.len(),
            needed: HEADER_LEN - bytes.len(),
        });
    }
    if bytes[0..4] != UNIT_MAGIC {
        return Err(UnitError::InvalidMagic);
    }
    if bytes[4] != UNIT_VERSION {
        return Err(UnitError::UnsupportedVersion(bytes[4]));
    }
    Ok(UnitHeader {
        version: bytes[4],
        byte_order: ByteOrder::from_marker(bytes[5])?,
        uses: Capabilities::from_bits(bytes[6]),
    })
}

/// Deserialize a blob produced by [`crate::serialize`].
///
/// The byte order is taken from the header, so blobs written with
/// `byte_swap` decode on any host.
pub fn deserialize(bytes: &[u8], options: &ReadOptions) -> UnitResult<UnitValue> {
    let header = read_header(bytes)?;
    let mut reader = Reader {
        bytes,
        pos: HEADER_LEN,
        order: header.byte_order,
        options,
        objects: 0,
    };
    let value = reader.value(0)?;
    if reader.pos != bytes.len() {
        return Err(UnitError::TrailingBytes(bytes.len() - reader.pos));
    }
    Ok(value)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    order: ByteOrder,
    options: &'a ReadOptions,
    objects: u32,
}

impl<'a> Reader<'a> {
    fn require(&self, capability: Capability) -> UnitResult<()> {
        if self.options.allow.contains(capability) {
            Ok(())
        } else {
            Err(UnitError::NotAllowed(capability))
        }
    }

    fn take(&mut self, n: usize) -> UnitResult<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(UnitError::UnexpectedEnd {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> UnitResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> UnitResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> UnitResult<u16> {
        let raw = self.array::<2>()?;
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        })
    }

    fn u32(&mut self) -> UnitResult<u32> {
        let raw = self.array::<4>()?;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    fn u64(&mut self) -> UnitResult<u64> {
        let raw = self.array::<8>()?;
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        })
    }

    /// Read a count of items that each occupy at least `min_item` bytes,
    /// rejecting counts the remaining input cannot possibly hold.
    fn count(&mut self, min_item: usize) -> UnitResult<usize> {
        let offset = self.pos;
        let count = self.u32()? as usize;
        let remaining = self.bytes.len() - self.pos;
        let needed = count.saturating_mul(min_item);
        if needed > remaining {
            return Err(UnitError::UnexpectedEnd {
                offset,
                needed: needed - remaining,
            });
        }
        Ok(count)
    }

    fn bytes(&mut self) -> UnitResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> UnitResult<String> {
        let offset = self.pos;
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| UnitError::InvalidUtf8(offset))
    }

    fn value(&mut self, depth: usize) -> UnitResult<UnitValue> {
        if depth > MAX_DEPTH {
            return Err(UnitError::TooDeep(MAX_DEPTH));
        }
        let offset = self.pos;
        let t = self.u8()?;
        let value = match t {
            tag::UNDEFINED => UnitValue::Undefined,
            tag::NULL => UnitValue::Null,
            tag::FALSE => UnitValue::Bool(false),
            tag::TRUE => UnitValue::Bool(true),
            tag::INT32 => UnitValue::Int32(self.u32()? as i32),
            tag::FLOAT64 => UnitValue::Float64(f64::from_bits(self.u64()?)),
            tag::STRING => UnitValue::String(self.string()?),
            tag::ARRAY => {
                self.objects += 1;
                let len = self.count(1)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(depth + 1)?);
                }
                UnitValue::Array(items)
            }
            tag::OBJECT => {
                self.objects += 1;
                // key length prefix plus a value tag
                let len = self.count(5)?;
                let mut props = Vec::with_capacity(len);
                for _ in 0..len {
                    let key = self.string()?;
                    props.push((key, self.value(depth + 1)?));
                }
                UnitValue::Object(props)
            }
            tag::ARRAY_BUFFER => {
                self.objects += 1;
                UnitValue::ArrayBuffer(self.bytes()?)
            }
            tag::SHARED_BUFFER => {
                self.require(Capability::SharedBuffer)?;
                let index = self.u32()?;
                if index >= self.options.shared_buffers {
                    return Err(UnitError::InvalidSharedBuffer {
                        index,
                        available: self.options.shared_buffers,
                    });
                }
                UnitValue::SharedBuffer(index)
            }
            tag::FUNCTION => {
                self.require(Capability::Bytecode)?;
                self.objects += 1;
                UnitValue::Function(self.function(depth)?)
            }
            tag::MODULE => {
                self.require(Capability::Bytecode)?;
                self.objects += 1;
                UnitValue::Module(self.module(depth)?)
            }
            tag::REFERENCE => {
                self.require(Capability::Reference)?;
                let index = self.u32()?;
                if index >= self.objects {
                    return Err(UnitError::InvalidReference {
                        index,
                        available: self.objects,
                    });
                }
                UnitValue::Reference(index)
            }
            other => return Err(UnitError::InvalidTag { tag: other, offset }),
        };
        Ok(value)
    }

    fn function(&mut self, depth: usize) -> UnitResult<FunctionUnit> {
        let name = self.string()?;
        let filename = self.string()?;
        let arg_count = self.u16()?;
        let bytecode = self.bytes()?;
        let len = self.count(1)?;
        let mut constants = Vec::with_capacity(len);
        for _ in 0..len {
            constants.push(self.value(depth + 1)?);
        }
        Ok(FunctionUnit {
            name,
            filename,
            arg_count,
            bytecode,
            constants,
        })
    }

    fn module(&mut self, depth: usize) -> UnitResult<ModuleUnit> {
        let name = self.string()?;
        let len = self.count(4)?;
        let mut requests = Vec::with_capacity(len);
        for _ in 0..len {
            requests.push(self.string()?);
        }
        let len = self.count(4)?;
        let mut exports = Vec::with_capacity(len);
        for _ in 0..len {
            exports.push(self.string()?);
        }
        let has_top_level_await = self.u8()? != 0;
        let body = self.function(depth)?;
        Ok(ModuleUnit {
            name,
            requests,
            exports,
            has_top_level_await,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{WriteOptions, serialize};
    use proptest::prelude::*;

    fn sample_module() -> UnitValue {
        UnitValue::Module(ModuleUnit {
            name: "/app/main.js".to_string(),
            requests: vec!["./dep.js".to_string(), "os".to_string()],
            exports: vec!["default".to_string(), "answer".to_string()],
            has_top_level_await: true,
            body: FunctionUnit {
                name: String::new(),
                filename: "/app/main.js".to_string(),
                arg_count: 0,
                bytecode: vec![0xde, 0xad, 0xbe, 0xef],
                constants: vec![
                    UnitValue::Int32(42),
                    UnitValue::String("héllo".to_string()),
                    UnitValue::Function(FunctionUnit {
                        name: "inner".to_string(),
                        filename: "/app/main.js".to_string(),
                        arg_count: 2,
                        bytecode: vec![1, 2, 3],
                        constants: vec![UnitValue::Float64(-0.5)],
                    }),
                ],
            },
        })
    }

    #[test]
    fn test_module_roundtrip() {
        let module = sample_module();
        let bytes = serialize(&module, &WriteOptions::bytecode()).unwrap();
        let restored = deserialize(&bytes, &ReadOptions::bytecode()).unwrap();
        assert_eq!(restored, module);
    }

    #[test]
    fn test_byte_swapped_module_roundtrip() {
        let module = sample_module();
        let bytes = serialize(&module, &WriteOptions::bytecode().byte_swap(true)).unwrap();
        let header = read_header(&bytes).unwrap();
        assert_eq!(header.byte_order, ByteOrder::native().swapped());
        assert!(header.uses.contains(Capability::Bytecode));

        let restored = deserialize(&bytes, &ReadOptions::bytecode()).unwrap();
        assert_eq!(restored, module);
    }

    #[test]
    fn test_invalid_magic() {
        let bytes = b"NOPE\x01\x00\x00\x00\x01";
        let result = deserialize(bytes, &ReadOptions::default());
        assert_eq!(result, Err(UnitError::InvalidMagic));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = serialize(&UnitValue::Null, &WriteOptions::default()).unwrap();
        bytes[4] = 99;
        let result = deserialize(&bytes, &ReadOptions::default());
        assert_eq!(result, Err(UnitError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = serialize(&sample_module(), &WriteOptions::bytecode()).unwrap();
        for cut in [3, HEADER_LEN, bytes.len() / 2, bytes.len() - 1] {
            let result = deserialize(&bytes[..cut], &ReadOptions::bytecode());
            assert!(
                matches!(result, Err(UnitError::UnexpectedEnd { .. })),
                "cut at {cut}: {result:?}"
            );
        }
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut bytes = serialize(&UnitValue::Array(vec![]), &WriteOptions::default()).unwrap();
        let huge = match ByteOrder::native() {
            ByteOrder::Little => u32::MAX.to_le_bytes(),
            ByteOrder::Big => u32::MAX.to_be_bytes(),
        };
        bytes[HEADER_LEN + 1..HEADER_LEN + 5].copy_from_slice(&huge);
        let result = deserialize(&bytes, &ReadOptions::default());
        assert!(matches!(result, Err(UnitError::UnexpectedEnd { .. })));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = serialize(&UnitValue::Bool(true), &WriteOptions::default()).unwrap();
        bytes.push(0);
        let result = deserialize(&bytes, &ReadOptions::default());
        assert_eq!(result, Err(UnitError::TrailingBytes(1)));
    }

    #[test]
    fn test_invalid_tag() {
        let mut bytes = serialize(&UnitValue::Null, &WriteOptions::default()).unwrap();
        bytes[HEADER_LEN] = 0xff;
        let result = deserialize(&bytes, &ReadOptions::default());
        assert_eq!(
            result,
            Err(UnitError::InvalidTag {
                tag: 0xff,
                offset: HEADER_LEN
            })
        );
    }

    #[test]
    fn test_bytecode_rejected_without_capability() {
        let bytes = serialize(&sample_module(), &WriteOptions::bytecode()).unwrap();
        let result = deserialize(&bytes, &ReadOptions::default());
        assert_eq!(result, Err(UnitError::NotAllowed(Capability::Bytecode)));
    }

    #[test]
    fn test_shared_buffer_index_checked() {
        let value = UnitValue::Array(vec![UnitValue::SharedBuffer(1)]);
        let bytes = serialize(&value, &WriteOptions::message()).unwrap();

        assert_eq!(
            deserialize(&bytes, &ReadOptions::message(1)),
            Err(UnitError::InvalidSharedBuffer {
                index: 1,
                available: 1
            })
        );
        assert_eq!(deserialize(&bytes, &ReadOptions::message(2)), Ok(value));
    }

    #[test]
    fn test_object_graph_with_references() {
        let shared = UnitValue::object([("x", UnitValue::Int32(1))]);
        let value = UnitValue::object([
            ("a", shared),
            ("b", UnitValue::Reference(1)),
            ("self", UnitValue::Reference(0)),
        ]);
        let bytes = serialize(&value, &WriteOptions::message()).unwrap();
        let restored = deserialize(&bytes, &ReadOptions::message(0)).unwrap();
        assert_eq!(restored, value);
        assert_eq!(restored.get("b"), Some(&UnitValue::Reference(1)));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes =
            serialize(&UnitValue::String("ab".into()), &WriteOptions::default()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0xff;
        let result = deserialize(&bytes, &ReadOptions::default());
        assert_eq!(result, Err(UnitError::InvalidUtf8(HEADER_LEN + 1)));
    }

    fn plain_value() -> impl Strategy<Value = UnitValue> {
        let leaf = prop_oneof![
            Just(UnitValue::Undefined),
            Just(UnitValue::Null),
            any::<bool>().prop_map(UnitValue::Bool),
            any::<i32>().prop_map(UnitValue::Int32),
            // NaN never compares equal
            any::<i64>().prop_map(|n| UnitValue::Float64(n as f64)),
            ".{0,12}".prop_map(UnitValue::String),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(UnitValue::ArrayBuffer),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(UnitValue::Array),
                proptest::collection::vec(("[a-z]{1,6}", inner), 0..6)
                    .prop_map(UnitValue::Object),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_plain_values_roundtrip_in_both_orders(value in plain_value(), swap in any::<bool>()) {
            let bytes = serialize(&value, &WriteOptions::default().byte_swap(swap)).unwrap();
            let restored = deserialize(&bytes, &ReadOptions::default()).unwrap();
            prop_assert_eq!(restored, value);
        }

        #[test]
        fn test_garbage_never_panics(tail in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut bytes = UNIT_MAGIC.to_vec();
            bytes.extend_from_slice(&[UNIT_VERSION, 0, 0b111, 0]);
            bytes.extend_from_slice(&tail);
            let _ = deserialize(&bytes, &ReadOptions::message(4).allow(Capability::Bytecode));
        }
    }
}
