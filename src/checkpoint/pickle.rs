//! Just enough pickle support to read the state dicts written by `torch.save`.
//!
//! Only the opcodes emitted for a dictionary of tensors are understood. Tensors are rebuilt
//! eagerly: whenever the stream reduces `torch._utils._rebuild_tensor_v2`, the referenced
//! storage is fetched through a [StorageLoader] and sliced into a [TensorData].
use burn::tensor::TensorData;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use half::{bf16, f16};
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::rc::Rc;
use std::sync::Arc;

/// Error type for pickle operations.
#[derive(thiserror::Error, Debug)]
pub enum PickleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "Invalid pickle opcode: 0x{0:02x}. The file may be corrupted or use an unsupported pickle protocol."
    )]
    InvalidOpCode(u8),

    #[error("Invalid or unsupported pickle protocol version: {0}. Supported versions are 2-5.")]
    InvalidProtocol(u8),

    #[error("Unexpected pickle opcode {0:?} in current context")]
    UnexpectedOpCode(OpCode),

    #[error(
        "Unsupported Python type '{0}'. This may indicate a full model save rather than a state_dict."
    )]
    UnsupportedType(String),

    #[error("Invalid data in pickle file: {0}")]
    InvalidData(String),

    #[error("Pickle stack underflow - the file may be corrupted")]
    StackUnderflow,

    #[error("Pickle memo reference {0} not found - the file may be corrupted")]
    MemoNotFound(u32),
}

type Result<T> = std::result::Result<T, PickleError>;

// https://github.com/python/cpython/blob/main/Lib/pickletools.py
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    Proto = 0x80,
    Frame = 0x95,
    Global = b'c',
    StackGlobal = 0x93,
    BinPut = b'q',
    LongBinPut = b'r',
    EmptyTuple = b')',
    Reduce = b'R',
    Mark = b'(',
    BinUnicode = b'X',
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    ShortBinString = b'U',
    BinInt = b'J',
    Int = b'I',
    Tuple = b't',
    BinPersId = b'Q',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    NewTrue = 0x88,
    NewFalse = 0x89,
    None = b'N',
    BinGet = b'h',
    LongBinGet = b'j',
    SetItem = b's',
    SetItems = b'u',
    EmptyDict = b'}',
    Dict = b'd',
    Build = b'b',
    Stop = b'.',
    NewObj = 0x81,
    EmptyList = b']',
    List = b'l',
    BinFloat = b'G',
    Append = b'a',
    Appends = b'e',
    Long1 = 0x8a,
    Memoize = 0x94,
}

// Avoid using FromPrimitive so as not to drag another dependency.
impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Self::Proto),
            0x95 => Ok(Self::Frame),
            b'c' => Ok(Self::Global),
            0x93 => Ok(Self::StackGlobal),
            b'q' => Ok(Self::BinPut),
            b'r' => Ok(Self::LongBinPut),
            b')' => Ok(Self::EmptyTuple),
            b'R' => Ok(Self::Reduce),
            b'(' => Ok(Self::Mark),
            b'X' => Ok(Self::BinUnicode),
            0x8c => Ok(Self::ShortBinUnicode),
            0x8d => Ok(Self::BinUnicode8),
            b'U' => Ok(Self::ShortBinString),
            b'J' => Ok(Self::BinInt),
            b'I' => Ok(Self::Int),
            b't' => Ok(Self::Tuple),
            b'Q' => Ok(Self::BinPersId),
            b'K' => Ok(Self::BinInt1),
            b'M' => Ok(Self::BinInt2),
            b'N' => Ok(Self::None),
            0x85 => Ok(Self::Tuple1),
            0x86 => Ok(Self::Tuple2),
            0x87 => Ok(Self::Tuple3),
            0x88 => Ok(Self::NewTrue),
            0x89 => Ok(Self::NewFalse),
            b'h' => Ok(Self::BinGet),
            b'j' => Ok(Self::LongBinGet),
            b's' => Ok(Self::SetItem),
            b'u' => Ok(Self::SetItems),
            b'}' => Ok(Self::EmptyDict),
            b'd' => Ok(Self::Dict),
            b'b' => Ok(Self::Build),
            b'.' => Ok(Self::Stop),
            0x81 => Ok(Self::NewObj),
            b']' => Ok(Self::EmptyList),
            b'l' => Ok(Self::List),
            b'G' => Ok(Self::BinFloat),
            b'a' => Ok(Self::Append),
            b'e' => Ok(Self::Appends),
            0x8a => Ok(Self::Long1),
            0x94 => Ok(Self::Memoize),
            value => Err(value),
        }
    }
}

/// A decoded pickle value.
///
/// Dictionaries keep their insertion order, which is the order `torch.save` wrote the
/// state dict in.
#[derive(Debug, Clone)]
pub enum Object {
    Class { module_name: String, name: String },
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Tuple(Vec<Object>),
    List(Vec<Object>),
    Dict(Vec<(String, Object)>),
    Persistent(Vec<Object>),
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Build {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Tensor(Rc<TensorData>),
    Mark,
}

/// Gives the unpickler access to the raw bytes of a tensor storage.
pub trait StorageLoader {
    /// Returns the bytes of the storage registered under `key` (e.g. `"0"`).
    fn load(&mut self, key: &str) -> io::Result<Arc<Vec<u8>>>;
}

/// Storage element types found in persistent ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl StorageType {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "DoubleStorage" => Ok(Self::F64),
            "FloatStorage" => Ok(Self::F32),
            "HalfStorage" => Ok(Self::F16),
            "BFloat16Storage" => Ok(Self::BF16),
            "LongStorage" => Ok(Self::I64),
            "IntStorage" => Ok(Self::I32),
            "ShortStorage" => Ok(Self::I16),
            "CharStorage" => Ok(Self::I8),
            "ByteStorage" => Ok(Self::U8),
            "BoolStorage" => Ok(Self::Bool),
            other => Err(PickleError::UnsupportedType(format!("torch.{other}"))),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }

    fn decode(&self, bytes: &[u8], shape: Vec<usize>) -> TensorData {
        let len = bytes.len() / self.size();
        match self {
            Self::F64 => {
                let mut values = vec![0.0f64; len];
                LittleEndian::read_f64_into(bytes, &mut values);
                TensorData::new(values, shape)
            }
            Self::F32 => {
                let mut values = vec![0.0f32; len];
                LittleEndian::read_f32_into(bytes, &mut values);
                TensorData::new(values, shape)
            }
            Self::F16 => {
                let mut bits = vec![0u16; len];
                LittleEndian::read_u16_into(bytes, &mut bits);
                let values: Vec<f16> = bits.into_iter().map(f16::from_bits).collect();
                TensorData::new(values, shape)
            }
            Self::BF16 => {
                let mut bits = vec![0u16; len];
                LittleEndian::read_u16_into(bytes, &mut bits);
                let values: Vec<bf16> = bits.into_iter().map(bf16::from_bits).collect();
                TensorData::new(values, shape)
            }
            Self::I64 => {
                let mut values = vec![0i64; len];
                LittleEndian::read_i64_into(bytes, &mut values);
                TensorData::new(values, shape)
            }
            Self::I32 => {
                let mut values = vec![0i32; len];
                LittleEndian::read_i32_into(bytes, &mut values);
                TensorData::new(values, shape)
            }
            Self::I16 => {
                let mut values = vec![0i16; len];
                LittleEndian::read_i16_into(bytes, &mut values);
                TensorData::new(values, shape)
            }
            Self::I8 => TensorData::new(bytes.iter().map(|b| *b as i8).collect::<Vec<_>>(), shape),
            Self::U8 => TensorData::new(bytes.to_vec(), shape),
            Self::Bool => TensorData::new(bytes.iter().map(|b| *b != 0).collect::<Vec<_>>(), shape),
        }
    }
}

fn read_to_newline<R: BufRead>(r: &mut R) -> Result<Vec<u8>> {
    let mut data: Vec<u8> = Vec::with_capacity(32);
    r.read_until(b'\n', &mut data)?;
    data.pop();
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    Ok(data)
}

fn buf_to_str(buf: Vec<u8>) -> Result<String> {
    String::from_utf8(buf).map_err(|e| PickleError::InvalidData(format!("Invalid UTF-8: {e}")))
}

fn read_string<R: BufRead>(r: &mut R, len: usize) -> Result<Object> {
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(Object::String(buf_to_str(data)?))
}

fn read_long1<R: BufRead>(r: &mut R) -> Result<Object> {
    let len = r.read_u8()? as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;

    let mut value = 0i64;
    for (i, &byte) in data.iter().enumerate().take(8) {
        value |= (byte as i64).wrapping_shl((i as u32) * 8);
    }
    // Little-endian two's complement, sign extend short encodings.
    if len < 8 && data.last().is_some_and(|&b| b & 0x80 != 0) {
        for i in len..8 {
            value |= 0xffi64.wrapping_shl((i as u32) * 8);
        }
    }
    Ok(Object::Int(value))
}

fn insert_item(dict: &mut Vec<(String, Object)>, key: Object, value: Object) -> Result<()> {
    let Object::String(key) = key else {
        return Err(PickleError::InvalidData(format!(
            "dict key must be a string, got {key:?}"
        )));
    };
    match dict.iter_mut().find(|(existing, _)| *existing == key) {
        Some(entry) => entry.1 = value,
        None => dict.push((key, value)),
    }
    Ok(())
}

fn int_tuple(obj: &Object, what: &str) -> Result<Vec<usize>> {
    let Object::Tuple(items) = obj else {
        return Err(PickleError::InvalidData(format!(
            "expected {what} tuple, got {obj:?}"
        )));
    };
    items
        .iter()
        .map(|item| match item {
            Object::Int(value) if *value >= 0 => Ok(*value as usize),
            _ => Err(PickleError::InvalidData(format!(
                "{what} must contain non-negative ints, got {item:?}"
            ))),
        })
        .collect()
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// The pickle virtual machine.
pub struct Unpickler<'a, S: StorageLoader> {
    stack: Vec<Object>,
    memo: HashMap<u32, Object>,
    storages: &'a mut S,
}

impl<'a, S: StorageLoader> Unpickler<'a, S> {
    pub fn new(storages: &'a mut S) -> Self {
        Self {
            stack: Vec::new(),
            memo: HashMap::new(),
            storages,
        }
    }

    fn push(&mut self, o: Object) {
        self.stack.push(o)
    }

    fn pop(&mut self) -> Result<Object> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&self) -> Result<Object> {
        self.stack.last().cloned().ok_or(PickleError::StackUnderflow)
    }

    fn last_mut(&mut self) -> Result<&mut Object> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn pop_to_marker(&mut self) -> Result<Vec<Object>> {
        let marker_pos = self
            .stack
            .iter()
            .rposition(|o| matches!(o, Object::Mark))
            .ok_or(PickleError::InvalidData("marker not found".to_string()))?;

        let result = self.stack.split_off(marker_pos + 1);
        self.stack.pop();
        Ok(result)
    }

    fn memo_get(&self, idx: u32) -> Result<Object> {
        self.memo
            .get(&idx)
            .cloned()
            .ok_or(PickleError::MemoNotFound(idx))
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let obj = self.top()?;
        self.memo.insert(idx, obj);
        Ok(())
    }

    /// Runs the stream until `STOP` and returns the top of the stack.
    pub fn load<R: BufRead>(mut self, r: &mut R) -> Result<Object> {
        loop {
            let op_code = r.read_u8()?;
            let op_code = OpCode::try_from(op_code).map_err(PickleError::InvalidOpCode)?;
            match op_code {
                OpCode::Proto => {
                    let version = r.read_u8()?;
                    if !(2..=5).contains(&version) {
                        return Err(PickleError::InvalidProtocol(version));
                    }
                }
                OpCode::Frame => {
                    // Framing only hints at buffering; the frame content follows inline.
                    r.read_u64::<LittleEndian>()?;
                }
                OpCode::Global => {
                    let module_name = buf_to_str(read_to_newline(r)?)?;
                    let name = buf_to_str(read_to_newline(r)?)?;
                    self.push(Object::Class { module_name, name });
                }
                OpCode::StackGlobal => {
                    let name = self.pop()?;
                    let module_name = self.pop()?;
                    match (module_name, name) {
                        (Object::String(module_name), Object::String(name)) => {
                            self.push(Object::Class { module_name, name })
                        }
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::BinInt => {
                    let v = r.read_i32::<LittleEndian>()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::Int => {
                    let s = buf_to_str(read_to_newline(r)?)?;
                    // Protocol 0 encodes booleans as INT 00/01.
                    let obj = match s.as_str() {
                        "00" => Object::Bool(false),
                        "01" => Object::Bool(true),
                        _ => Object::Int(s.parse::<i64>().map_err(|e| {
                            PickleError::InvalidData(format!("Invalid INT value '{s}': {e}"))
                        })?),
                    };
                    self.push(obj);
                }
                OpCode::BinInt1 => {
                    let v = r.read_u8()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::BinInt2 => {
                    let v = r.read_u16::<LittleEndian>()?;
                    self.push(Object::Int(v as i64));
                }
                OpCode::Long1 => {
                    let obj = read_long1(r)?;
                    self.push(obj);
                }
                OpCode::BinFloat => {
                    // Python's BINFLOAT uses big-endian encoding
                    let v = r.read_f64::<byteorder::BigEndian>()?;
                    self.push(Object::Float(v));
                }
                OpCode::BinUnicode => {
                    let len = r.read_u32::<LittleEndian>()? as usize;
                    let obj = read_string(r, len)?;
                    self.push(obj);
                }
                OpCode::ShortBinUnicode | OpCode::ShortBinString => {
                    let len = r.read_u8()? as usize;
                    let obj = read_string(r, len)?;
                    self.push(obj);
                }
                OpCode::BinUnicode8 => {
                    let len = r.read_u64::<LittleEndian>()? as usize;
                    let obj = read_string(r, len)?;
                    self.push(obj);
                }
                OpCode::None => self.push(Object::None),
                OpCode::NewTrue => self.push(Object::Bool(true)),
                OpCode::NewFalse => self.push(Object::Bool(false)),
                OpCode::EmptyTuple => self.push(Object::Tuple(Vec::new())),
                OpCode::EmptyList => self.push(Object::List(Vec::new())),
                OpCode::EmptyDict => self.push(Object::Dict(Vec::new())),
                OpCode::Mark => self.push(Object::Mark),
                OpCode::Tuple => {
                    let objs = self.pop_to_marker()?;
                    self.push(Object::Tuple(objs))
                }
                OpCode::Tuple1 => {
                    let obj = self.pop()?;
                    self.push(Object::Tuple(vec![obj]))
                }
                OpCode::Tuple2 => {
                    let obj2 = self.pop()?;
                    let obj1 = self.pop()?;
                    self.push(Object::Tuple(vec![obj1, obj2]))
                }
                OpCode::Tuple3 => {
                    let obj3 = self.pop()?;
                    let obj2 = self.pop()?;
                    let obj1 = self.pop()?;
                    self.push(Object::Tuple(vec![obj1, obj2, obj3]))
                }
                OpCode::List => {
                    let objs = self.pop_to_marker()?;
                    self.push(Object::List(objs));
                }
                OpCode::Append => {
                    let value = self.pop()?;
                    match self.last_mut()? {
                        Object::List(list) => list.push(value),
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::Appends => {
                    let objs = self.pop_to_marker()?;
                    match self.last_mut()? {
                        Object::List(list) => list.extend(objs),
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::Dict => {
                    let objs = self.pop_to_marker()?;
                    if objs.len() % 2 != 0 {
                        return Err(PickleError::InvalidData(
                            "dict requires even number of objects".to_string(),
                        ));
                    }
                    let mut dict = Vec::with_capacity(objs.len() / 2);
                    let mut objs = objs.into_iter();
                    while let (Some(key), Some(value)) = (objs.next(), objs.next()) {
                        insert_item(&mut dict, key, value)?;
                    }
                    self.push(Object::Dict(dict));
                }
                OpCode::SetItem => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.last_mut()? {
                        Object::Dict(dict) => insert_item(dict, key, value)?,
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::SetItems => {
                    let objs = self.pop_to_marker()?;
                    if objs.len() % 2 != 0 {
                        return Err(PickleError::InvalidData(
                            "setitems requires even number of objects".to_string(),
                        ));
                    }
                    match self.last_mut()? {
                        Object::Dict(dict) => {
                            let mut objs = objs.into_iter();
                            while let (Some(key), Some(value)) = (objs.next(), objs.next()) {
                                insert_item(dict, key, value)?;
                            }
                        }
                        _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                    }
                }
                OpCode::BinPut => {
                    let idx = r.read_u8()? as u32;
                    self.memo_put(idx)?;
                }
                OpCode::LongBinPut => {
                    let idx = r.read_u32::<LittleEndian>()?;
                    self.memo_put(idx)?;
                }
                OpCode::Memoize => {
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                OpCode::BinGet => {
                    let idx = r.read_u8()? as u32;
                    let obj = self.memo_get(idx)?;
                    self.push(obj);
                }
                OpCode::LongBinGet => {
                    let idx = r.read_u32::<LittleEndian>()?;
                    let obj = self.memo_get(idx)?;
                    self.push(obj);
                }
                OpCode::BinPersId => match self.pop()? {
                    // ('storage', <storage type>, key, location, numel)
                    Object::Tuple(tuple) => self.push(Object::Persistent(tuple)),
                    pid => {
                        return Err(PickleError::InvalidData(format!(
                            "persistent id must be a tuple, got {pid:?}"
                        )));
                    }
                },
                OpCode::Reduce => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let obj = self.reduce(callable, args)?;
                    self.push(obj);
                }
                OpCode::Build => {
                    let args = self.pop()?;
                    let obj = self.pop()?;
                    match obj {
                        // The state of an OrderedDict holds attributes such as `_metadata`,
                        // not items.
                        Object::Dict(_) => self.push(obj),
                        _ => self.push(Object::Build {
                            callable: Box::new(obj),
                            args: Box::new(args),
                        }),
                    }
                }
                OpCode::NewObj => {
                    let args = self.pop()?;
                    let cls = self.pop()?;
                    self.push(Object::Reduce {
                        callable: Box::new(cls),
                        args: Box::new(args),
                    });
                }
                OpCode::Stop => break,
            }
        }
        self.pop()
    }

    fn reduce(&mut self, callable: Object, args: Object) -> Result<Object> {
        let Object::Class { module_name, name } = &callable else {
            return Err(PickleError::InvalidData(format!(
                "reduce: expected class got {callable:?}"
            )));
        };
        match (module_name.as_str(), name.as_str()) {
            ("collections", "OrderedDict") => Ok(Object::Dict(Vec::new())),
            ("torch._utils", "_rebuild_tensor_v2") => self.rebuild_tensor(args),
            ("torch._utils", "_rebuild_parameter") => match args {
                // (data, requires_grad, backward_hooks)
                Object::Tuple(mut args) if !args.is_empty() => Ok(args.swap_remove(0)),
                _ => Err(PickleError::InvalidData(
                    "rebuild_parameter: expected a non-empty tuple".to_string(),
                )),
            },
            ("torch._tensor", "_rebuild_from_type_v2") => match args {
                // (func, new_type, args, state)
                Object::Tuple(args) if args.len() >= 3 => {
                    let mut args = args.into_iter();
                    let func = args.next().unwrap_or(Object::None);
                    let func_args = args.nth(1).unwrap_or(Object::None);
                    self.reduce(func, func_args)
                }
                _ => Err(PickleError::InvalidData(
                    "rebuild_from_type_v2: expected at least 3 args".to_string(),
                )),
            },
            _ => Err(PickleError::UnsupportedType(format!("{module_name}.{name}"))),
        }
    }

    fn rebuild_tensor(&mut self, args: Object) -> Result<Object> {
        // (storage, storage_offset, shape, stride, requires_grad, backward_hooks)
        let Object::Tuple(args) = args else {
            return Err(PickleError::InvalidData(format!(
                "rebuild_tensor_v2: expected tuple got {args:?}"
            )));
        };
        if args.len() < 4 {
            return Err(PickleError::InvalidData(format!(
                "rebuild_tensor_v2: expected at least 4 args, got {}",
                args.len()
            )));
        }

        let Object::Persistent(storage) = &args[0] else {
            return Err(PickleError::InvalidData(format!(
                "rebuild_tensor_v2: expected persistent id got {:?}",
                args[0]
            )));
        };
        if storage.len() < 3 {
            return Err(PickleError::InvalidData(format!(
                "storage persistent id too short: {storage:?}"
            )));
        }
        let storage_type = match &storage[1] {
            Object::Class { name, .. } | Object::String(name) => StorageType::from_name(name)?,
            other => {
                return Err(PickleError::InvalidData(format!(
                    "unknown storage type {other:?}"
                )));
            }
        };
        let key = match &storage[2] {
            Object::String(key) => key.clone(),
            Object::Int(key) => key.to_string(),
            other => {
                return Err(PickleError::InvalidData(format!(
                    "unknown storage key {other:?}"
                )));
            }
        };

        let offset = match &args[1] {
            Object::Int(offset) if *offset >= 0 => *offset as usize,
            other => {
                return Err(PickleError::InvalidData(format!(
                    "invalid storage offset {other:?}"
                )));
            }
        };
        let shape = int_tuple(&args[2], "shape")?;
        let stride = int_tuple(&args[3], "stride")?;
        let numel = shape
            .iter()
            .try_fold(1usize, |numel, dim| numel.checked_mul(*dim))
            .ok_or_else(|| {
                PickleError::InvalidData(format!("tensor shape {shape:?} overflows"))
            })?;

        if numel > 1 && stride != contiguous_strides(&shape) {
            return Err(PickleError::InvalidData(format!(
                "non-contiguous tensor (shape {shape:?}, stride {stride:?}) is not supported"
            )));
        }

        let bytes = self.storages.load(&key)?;
        let size = storage_type.size();
        let (start, end) = offset
            .checked_mul(size)
            .and_then(|start| Some((start, start.checked_add(numel.checked_mul(size)?)?)))
            .ok_or_else(|| {
                PickleError::InvalidData(format!(
                    "storage '{key}' range (offset {offset}, {numel} elements) overflows"
                ))
            })?;
        if end > bytes.len() {
            return Err(PickleError::InvalidData(format!(
                "storage '{key}' holds {} bytes, tensor needs bytes {start}..{end}",
                bytes.len()
            )));
        }

        let data = storage_type.decode(&bytes[start..end], shape);
        Ok(Object::Tensor(Rc::new(data)))
    }
}
