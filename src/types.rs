//! Kernel argument vocabulary: declared types, bound values, defines.

use std::fmt;
use std::str::FromStr;

use crate::buffer::Buffer;
use crate::driver::Driver;
use crate::ClError;

/// Declared type of a kernel parameter.
///
/// The string forms (`"int"`, `"cl_mem"`, `"__local"`, `"#define"`, ...) are
/// the OpenCL spellings and round-trip through [`FromStr`] / [`Display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Half,
    Float,
    Double,
    Float2,
    Float3,
    Float4,
    Float8,
    Float16,
    /// `__local` scratch memory; the bound value is a byte size.
    Local,
    /// A global memory object; the bound value is a [`Buffer`].
    Mem,
    /// Not an argument: declares a preprocessor define that starts unset.
    Define,
}

impl ArgType {
    const TOKENS: [(ArgType, &'static str); 19] = [
        (ArgType::Char, "char"),
        (ArgType::UChar, "uchar"),
        (ArgType::Short, "short"),
        (ArgType::UShort, "ushort"),
        (ArgType::Int, "int"),
        (ArgType::UInt, "uint"),
        (ArgType::Long, "long"),
        (ArgType::ULong, "ulong"),
        (ArgType::Half, "half"),
        (ArgType::Float, "float"),
        (ArgType::Double, "double"),
        (ArgType::Float2, "float2"),
        (ArgType::Float3, "float3"),
        (ArgType::Float4, "float4"),
        (ArgType::Float8, "float8"),
        (ArgType::Float16, "float16"),
        (ArgType::Local, "__local"),
        (ArgType::Mem, "cl_mem"),
        (ArgType::Define, "#define"),
    ];

    pub fn token(self) -> &'static str {
        Self::TOKENS
            .iter()
            .find(|(ty, _)| *ty == self)
            .map(|(_, tok)| *tok)
            .unwrap_or("?")
    }

    /// Whether `value` may be bound to a parameter of this type.
    pub fn accepts<D: Driver>(self, value: &ArgValue<D>) -> bool {
        match (self, value) {
            (ArgType::Mem, ArgValue::Mem(_)) => true,
            (ArgType::Local, ArgValue::Local(_)) => true,
            (ArgType::Define, _) => false,
            (ty, ArgValue::Scalar(s)) => s.arg_type() == ty,
            _ => false,
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ArgType {
    type Err = ClError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::TOKENS
            .iter()
            .find(|(_, tok)| *tok == s)
            .map(|(ty, _)| *ty)
            .ok_or_else(|| ClError::usage(format!("unknown argument type token {s:?}")))
    }
}

/// A by-value kernel argument.
///
/// `Half` carries the raw IEEE 754 binary16 bits. `Float3` is passed with
/// the 16-byte size and alignment OpenCL gives `float3`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Half(u16),
    Float(f32),
    Double(f64),
    Float2([f32; 2]),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Float8([f32; 8]),
    Float16([f32; 16]),
}

impl Scalar {
    pub fn arg_type(&self) -> ArgType {
        match self {
            Scalar::Char(_) => ArgType::Char,
            Scalar::UChar(_) => ArgType::UChar,
            Scalar::Short(_) => ArgType::Short,
            Scalar::UShort(_) => ArgType::UShort,
            Scalar::Int(_) => ArgType::Int,
            Scalar::UInt(_) => ArgType::UInt,
            Scalar::Long(_) => ArgType::Long,
            Scalar::ULong(_) => ArgType::ULong,
            Scalar::Half(_) => ArgType::Half,
            Scalar::Float(_) => ArgType::Float,
            Scalar::Double(_) => ArgType::Double,
            Scalar::Float2(_) => ArgType::Float2,
            Scalar::Float3(_) => ArgType::Float3,
            Scalar::Float4(_) => ArgType::Float4,
            Scalar::Float8(_) => ArgType::Float8,
            Scalar::Float16(_) => ArgType::Float16,
        }
    }

    /// Native-endian bytes as the device expects them.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match self {
            Scalar::Char(v) => v.to_ne_bytes().to_vec(),
            Scalar::UChar(v) => vec![*v],
            Scalar::Short(v) => v.to_ne_bytes().to_vec(),
            Scalar::UShort(v) | Scalar::Half(v) => v.to_ne_bytes().to_vec(),
            Scalar::Int(v) => v.to_ne_bytes().to_vec(),
            Scalar::UInt(v) => v.to_ne_bytes().to_vec(),
            Scalar::Long(v) => v.to_ne_bytes().to_vec(),
            Scalar::ULong(v) => v.to_ne_bytes().to_vec(),
            Scalar::Float(v) => v.to_ne_bytes().to_vec(),
            Scalar::Double(v) => v.to_ne_bytes().to_vec(),
            Scalar::Float2(v) => bytemuck::cast_slice(v).to_vec(),
            Scalar::Float3([x, y, z]) => bytemuck::cast_slice(&[*x, *y, *z, 0.0]).to_vec(),
            Scalar::Float4(v) => bytemuck::cast_slice(v).to_vec(),
            Scalar::Float8(v) => bytemuck::cast_slice(v).to_vec(),
            Scalar::Float16(v) => bytemuck::cast_slice(v).to_vec(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Char(v) => write!(f, "{v}"),
            Scalar::UChar(v) => write!(f, "{v}"),
            Scalar::Short(v) => write!(f, "{v}"),
            Scalar::UShort(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::UInt(v) => write!(f, "{v}"),
            Scalar::Long(v) => write!(f, "{v}"),
            Scalar::ULong(v) => write!(f, "{v}"),
            Scalar::Half(bits) => write!(f, "half(0x{bits:04x})"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Double(v) => write!(f, "{v}"),
            Scalar::Float2(v) => write!(f, "{v:?}"),
            Scalar::Float3(v) => write!(f, "{v:?}"),
            Scalar::Float4(v) => write!(f, "{v:?}"),
            Scalar::Float8(v) => write!(f, "{v:?}"),
            Scalar::Float16(v) => write!(f, "{v:?}"),
        }
    }
}

macro_rules! scalar_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Scalar {
                fn from(v: $t) -> Self {
                    Scalar::$variant(v)
                }
            }

            impl<D: Driver> From<$t> for ArgValue<D> {
                fn from(v: $t) -> Self {
                    ArgValue::Scalar(Scalar::$variant(v))
                }
            }
        )*
    };
}

scalar_from! {
    i8 => Char,
    u8 => UChar,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f32 => Float,
    f64 => Double,
    [f32; 2] => Float2,
    [f32; 3] => Float3,
    [f32; 4] => Float4,
    [f32; 8] => Float8,
    [f32; 16] => Float16,
}

/// Value held by a kernel argument slot.
pub enum ArgValue<D: Driver> {
    /// A device buffer, compared by identity.
    Mem(Buffer<D>),
    Scalar(Scalar),
    /// `__local` allocation of this many bytes.
    Local(usize),
}

impl<D: Driver> ArgValue<D> {
    pub fn local(bytes: usize) -> Self {
        ArgValue::Local(bytes)
    }

    pub fn as_buffer(&self) -> Option<&Buffer<D>> {
        match self {
            ArgValue::Mem(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            ArgValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Type this value would satisfy.
    pub fn arg_type(&self) -> ArgType {
        match self {
            ArgValue::Mem(_) => ArgType::Mem,
            ArgValue::Scalar(s) => s.arg_type(),
            ArgValue::Local(_) => ArgType::Local,
        }
    }
}

impl<D: Driver> Clone for ArgValue<D> {
    fn clone(&self) -> Self {
        match self {
            ArgValue::Mem(b) => ArgValue::Mem(b.clone()),
            ArgValue::Scalar(s) => ArgValue::Scalar(*s),
            ArgValue::Local(n) => ArgValue::Local(*n),
        }
    }
}

impl<D: Driver> PartialEq for ArgValue<D> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ArgValue::Mem(a), ArgValue::Mem(b)) => a.same_allocation(b),
            (ArgValue::Scalar(a), ArgValue::Scalar(b)) => a == b,
            (ArgValue::Local(a), ArgValue::Local(b)) => a == b,
            _ => false,
        }
    }
}

impl<D: Driver> fmt::Debug for ArgValue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Mem(b) => write!(f, "Mem({})", b.name()),
            ArgValue::Scalar(s) => write!(f, "Scalar({s:?})"),
            ArgValue::Local(n) => write!(f, "Local({n})"),
        }
    }
}

impl<D: Driver> fmt::Display for ArgValue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Mem(b) => write!(f, "buffer {}", b.name()),
            ArgValue::Scalar(s) => write!(f, "{s}"),
            ArgValue::Local(n) => write!(f, "__local[{n}]"),
        }
    }
}

impl<D: Driver> From<Buffer<D>> for ArgValue<D> {
    fn from(b: Buffer<D>) -> Self {
        ArgValue::Mem(b)
    }
}

impl<D: Driver> From<&Buffer<D>> for ArgValue<D> {
    fn from(b: &Buffer<D>) -> Self {
        ArgValue::Mem(b.clone())
    }
}

impl<D: Driver> From<Scalar> for ArgValue<D> {
    fn from(s: Scalar) -> Self {
        ArgValue::Scalar(s)
    }
}

/// Value of a preprocessor define.
#[derive(Debug, Clone, PartialEq)]
pub enum DefineValue {
    /// Declared but never given a value. A kernel with an unset define
    /// cannot be compiled.
    Unset,
    /// Emitted as a bare `#define NAME`.
    NoValue,
    Text(String),
    Int(i64),
    Float(f64),
    /// `true` emits `#define NAME true`; `false` leaves the define out.
    Bool(bool),
}

impl DefineValue {
    /// The `#define` line for `key`, or `None` if the define is left out of
    /// the prefix. Unset defines are rejected before this is reached.
    pub fn directive(&self, key: &str) -> Option<String> {
        match self {
            DefineValue::Unset | DefineValue::Bool(false) => None,
            DefineValue::NoValue => Some(format!("#define {key}")),
            DefineValue::Text(v) => Some(format!("#define {key} {v}")),
            DefineValue::Int(v) => Some(format!("#define {key} {v}")),
            DefineValue::Float(v) => Some(format!("#define {key} {v:?}")),
            DefineValue::Bool(true) => Some(format!("#define {key} true")),
        }
    }
}

impl From<&str> for DefineValue {
    fn from(v: &str) -> Self {
        DefineValue::Text(v.to_string())
    }
}

impl From<String> for DefineValue {
    fn from(v: String) -> Self {
        DefineValue::Text(v)
    }
}

impl From<i64> for DefineValue {
    fn from(v: i64) -> Self {
        DefineValue::Int(v)
    }
}

impl From<i32> for DefineValue {
    fn from(v: i32) -> Self {
        DefineValue::Int(v.into())
    }
}

impl From<u32> for DefineValue {
    fn from(v: u32) -> Self {
        DefineValue::Int(v.into())
    }
}

impl From<usize> for DefineValue {
    fn from(v: usize) -> Self {
        DefineValue::Int(v as i64)
    }
}

impl From<f64> for DefineValue {
    fn from(v: f64) -> Self {
        DefineValue::Float(v)
    }
}

impl From<f32> for DefineValue {
    fn from(v: f32) -> Self {
        DefineValue::Float(v.into())
    }
}

impl From<bool> for DefineValue {
    fn from(v: bool) -> Self {
        DefineValue::Bool(v)
    }
}

/// One declared kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: Option<String>,
    pub ty: ArgType,
}

impl Param {
    pub fn positional(ty: ArgType) -> Self {
        Self { name: None, ty }
    }

    pub fn named(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            name: Some(name.into()),
            ty,
        }
    }

    /// A define that must be given a value before the kernel can compile.
    pub fn define(name: impl Into<String>) -> Self {
        Self::named(name, ArgType::Define)
    }
}

/// Ordered parameter list of a kernel.
///
/// `Define` parameters are pulled out as declared defines; every other
/// parameter is an argument slot, numbered in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new(params: Vec<Param>) -> Self {
        Self { params }
    }

    pub fn arg(mut self, ty: ArgType) -> Self {
        self.params.push(Param::positional(ty));
        self
    }

    pub fn named(mut self, name: impl Into<String>, ty: ArgType) -> Self {
        self.params.push(Param::named(name, ty));
        self
    }

    pub fn define(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param::define(name));
        self
    }

    /// Argument slots in binding order.
    pub fn args(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.ty != ArgType::Define)
    }

    /// Names of declared defines.
    pub fn defines(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|p| p.ty == ArgType::Define)
            .filter_map(|p| p.name.as_deref())
    }
}

impl From<&[ArgType]> for Signature {
    fn from(types: &[ArgType]) -> Self {
        Self::new(types.iter().copied().map(Param::positional).collect())
    }
}

impl<const N: usize> From<&[ArgType; N]> for Signature {
    fn from(types: &[ArgType; N]) -> Self {
        Self::from(&types[..])
    }
}

impl From<Vec<ArgType>> for Signature {
    fn from(types: Vec<ArgType>) -> Self {
        Self::from(types.as_slice())
    }
}

impl From<Vec<Param>> for Signature {
    fn from(params: Vec<Param>) -> Self {
        Self::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;
    use rstest::rstest;

    #[rstest]
    #[case("int", ArgType::Int)]
    #[case("cl_mem", ArgType::Mem)]
    #[case("__local", ArgType::Local)]
    #[case("#define", ArgType::Define)]
    #[case("float16", ArgType::Float16)]
    fn test_token_round_trip(#[case] token: &str, #[case] ty: ArgType) {
        assert_eq!(token.parse::<ArgType>().unwrap(), ty);
        assert_eq!(ty.to_string(), token);
    }

    #[test]
    fn test_unknown_token() {
        let err = "int32".parse::<ArgType>().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UsageError);
    }

    #[test]
    fn test_accepts_matches_scalar_type() {
        let v: ArgValue<SimDriver> = 3i32.into();
        assert!(ArgType::Int.accepts(&v));
        assert!(!ArgType::UInt.accepts(&v));
        assert!(!ArgType::Mem.accepts(&v));
        assert!(!ArgType::Define.accepts(&v));
        assert!(ArgType::Local.accepts(&ArgValue::<SimDriver>::local(64)));
    }

    #[test]
    fn test_float3_is_padded() {
        let bytes = Scalar::Float3([1.0, 2.0, 3.0]).to_ne_bytes();
        assert_eq!(bytes.len(), 16);
    }

    #[rstest]
    #[case(DefineValue::Int(4), Some("#define W 4"))]
    #[case(DefineValue::from("float"), Some("#define W float"))]
    #[case(DefineValue::NoValue, Some("#define W"))]
    #[case(DefineValue::Bool(true), Some("#define W true"))]
    #[case(DefineValue::Bool(false), None)]
    #[case(DefineValue::Float(0.5), Some("#define W 0.5"))]
    fn test_define_directive(#[case] value: DefineValue, #[case] expected: Option<&str>) {
        assert_eq!(value.directive("W").as_deref(), expected);
    }

    #[test]
    fn test_signature_splits_defines() {
        let sig = Signature::default()
            .named("points", ArgType::Mem)
            .define("WIDTH")
            .arg(ArgType::UInt);
        let args: Vec<_> = sig.args().map(|p| p.ty).collect();
        assert_eq!(args, vec![ArgType::Mem, ArgType::UInt]);
        assert_eq!(sig.defines().collect::<Vec<_>>(), vec!["WIDTH"]);
    }
}
