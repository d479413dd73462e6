//! Engine-independent value tree carried by a serialized unit.

/// A value in a serialized unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Small integer
    Int32(i32),
    /// Double precision number
    Float64(f64),
    /// UTF-8 string
    String(String),
    /// Dense array
    Array(Vec<UnitValue>),
    /// Plain object, properties in insertion order
    Object(Vec<(String, UnitValue)>),
    /// Owned binary buffer (copied on transfer)
    ArrayBuffer(Vec<u8>),
    /// Index into the shared buffer table carried next to the blob
    SharedBuffer(u32),
    /// Compiled function
    Function(FunctionUnit),
    /// Compiled module
    Module(ModuleUnit),
    /// Back-reference to the n-th object (array, object, buffer, function or
    /// module) emitted earlier in the same blob
    Reference(u32),
}

impl UnitValue {
    /// Whether this value opens a new slot in the object table
    pub(crate) fn is_object(&self) -> bool {
        matches!(
            self,
            UnitValue::Array(_)
                | UnitValue::Object(_)
                | UnitValue::ArrayBuffer(_)
                | UnitValue::Function(_)
                | UnitValue::Module(_)
        )
    }

    /// Convenience constructor for object values
    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, UnitValue)>) -> Self {
        UnitValue::Object(props.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up an object property
    pub fn get(&self, key: &str) -> Option<&UnitValue> {
        match self {
            UnitValue::Object(props) => props.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Whether the value is a compiled function or module
    pub fn is_compiled(&self) -> bool {
        matches!(self, UnitValue::Function(_) | UnitValue::Module(_))
    }
}

/// A compiled function: opaque engine bytecode plus its constant pool
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionUnit {
    /// Function name (empty for anonymous and top-level code)
    pub name: String,
    /// Source file name used in stack traces
    pub filename: String,
    /// Declared parameter count
    pub arg_count: u16,
    /// Engine bytecode, opaque to the codec
    pub bytecode: Vec<u8>,
    /// Constant pool, may contain nested functions
    pub constants: Vec<UnitValue>,
}

/// A compiled module
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleUnit {
    /// Canonical module name
    pub name: String,
    /// Requested specifiers in source order
    pub requests: Vec<String>,
    /// Exported names
    pub exports: Vec<String>,
    /// Whether the module body uses top-level await
    pub has_top_level_await: bool,
    /// Module body
    pub body: FunctionUnit,
}
