//! Representation domains for keys and values.
//!
//! A [`Domain`] is the closed set of representation categories a table can be
//! specialized for. Everything that differs between categories (stored vs
//! presented form, equality, default value, how free/removed slots are
//! marked) is answered by a [`DomainStrategy`] object reached through
//! [`Domain::strategy`]. Callers never branch on the category themselves.
//!
//! Stored forms:
//! - integral and floating domains store raw bit patterns (`Datum::Bits`),
//!   masked to the domain width;
//! - reference domains store shared strings (`Datum::Ref`), `None` being null.

use core::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Bit width of a numeric domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }

    pub const fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// Number of distinct bit patterns of this width.
    pub const fn cardinality(self) -> u128 {
        1u128 << self.bits()
    }
}

/// Width of a floating-point domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FloatWidth {
    F32,
    F64,
}

impl FloatWidth {
    pub const fn width(self) -> Width {
        match self {
            FloatWidth::F32 => Width::W32,
            FloatWidth::F64 => Width::W64,
        }
    }

    /// Bit pattern every NaN key is folded into.
    pub const fn canonical_nan(self) -> u64 {
        match self {
            FloatWidth::F32 => 0x7FC0_0000,
            FloatWidth::F64 => 0x7FF8_0000_0000_0000,
        }
    }

    fn is_nan(self, bits: u64) -> bool {
        match self {
            FloatWidth::F32 => f32::from_bits(bits as u32).is_nan(),
            FloatWidth::F64 => f64::from_bits(bits).is_nan(),
        }
    }
}

/// Representation category of a key or value column.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Domain {
    Integral { width: Width, signed: bool },
    FloatingPoint { width: FloatWidth },
    /// Shared references. As a key domain, `nullable` is the null-key policy:
    /// a null key is stored in a dedicated slot outside the probe sequence.
    Reference { nullable: bool },
}

pub type KeyDomain = Domain;
pub type ValueDomain = Domain;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DomainCategory {
    Integral,
    FloatingPoint,
    Reference,
}

impl fmt::Display for DomainCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DomainCategory::Integral => "integral",
            DomainCategory::FloatingPoint => "floating-point",
            DomainCategory::Reference => "reference",
        })
    }
}

impl Domain {
    pub const fn int(width: Width, signed: bool) -> Self {
        Domain::Integral { width, signed }
    }

    pub const fn float32() -> Self {
        Domain::FloatingPoint {
            width: FloatWidth::F32,
        }
    }

    pub const fn float64() -> Self {
        Domain::FloatingPoint {
            width: FloatWidth::F64,
        }
    }

    pub const fn reference(nullable: bool) -> Self {
        Domain::Reference { nullable }
    }

    pub fn category(&self) -> DomainCategory {
        match self {
            Domain::Integral { .. } => DomainCategory::Integral,
            Domain::FloatingPoint { .. } => DomainCategory::FloatingPoint,
            Domain::Reference { .. } => DomainCategory::Reference,
        }
    }

    /// Bit width for numeric domains, `None` for references.
    pub fn width(&self) -> Option<Width> {
        match self {
            Domain::Integral { width, .. } => Some(*width),
            Domain::FloatingPoint { width } => Some(width.width()),
            Domain::Reference { .. } => None,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Domain::Reference { nullable: true })
    }

    pub fn strategy(&self) -> &'static dyn DomainStrategy {
        match *self {
            Domain::Integral { width, signed } => match (width, signed) {
                (Width::W8, true) => &I8,
                (Width::W16, true) => &I16,
                (Width::W32, true) => &I32,
                (Width::W64, true) => &I64,
                (Width::W8, false) => &U8,
                (Width::W16, false) => &U16,
                (Width::W32, false) => &U32,
                (Width::W64, false) => &U64,
            },
            Domain::FloatingPoint {
                width: FloatWidth::F32,
            } => &F32,
            Domain::FloatingPoint {
                width: FloatWidth::F64,
            } => &F64,
            Domain::Reference { nullable: true } => &NULLABLE_REF,
            Domain::Reference { nullable: false } => &NON_NULL_REF,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Integral { width, signed } => {
                write!(f, "{}{}", if *signed { 'i' } else { 'u' }, width.bits())
            }
            Domain::FloatingPoint { width } => write!(f, "f{}", width.width().bits()),
            Domain::Reference { nullable: true } => f.write_str("ref?"),
            Domain::Reference { nullable: false } => f.write_str("ref"),
        }
    }
}

/// Runtime datum flowing through the plan executor and the table API.
#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Int(i64),
    Float(f64),
    Bool(bool),
    Ref(Option<Rc<str>>),
    /// Stored form of numeric domains.
    Bits(u64),
}

impl Datum {
    pub fn null() -> Self {
        Datum::Ref(None)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Ref(None))
    }

    pub fn bits(&self) -> Option<u64> {
        match self {
            Datum::Bits(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int(v as i64)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<f32> for Datum {
    fn from(v: f32) -> Self {
        Datum::Float(v as f64)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Ref(Some(Rc::from(v)))
    }
}

impl From<Option<&str>> for Datum {
    fn from(v: Option<&str>) -> Self {
        Datum::Ref(v.map(Rc::from))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("value {value} does not fit the {domain} domain")]
    OutOfRange { value: i64, domain: Domain },
    #[error("expected a {expected} datum, found {found:?}")]
    Mismatch {
        expected: DomainCategory,
        found: Datum,
    },
    #[error("null is not permitted in the {domain} domain")]
    NullNotPermitted { domain: Domain },
    #[error("{value} overflows the {domain} domain")]
    FloatOverflow { value: f64, domain: Domain },
}

/// How free and removed slots are told apart from keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SentinelPolicy {
    /// Markers are values of the key domain itself and may collide with a
    /// real key, in which case they are rebound.
    InBand {
        free: u64,
        removed: u64,
        perturbation: Perturbation,
    },
    /// Free is null and removed is a singleton outside the key space.
    OutOfBand,
}

/// Search order used when a marker has to move.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Perturbation {
    Decrement,
    SignFlipThenDecrement,
}

/// Category-specific behavior of a domain.
pub trait DomainStrategy: Sync {
    fn domain(&self) -> Domain;

    /// Stored form to presented form.
    fn wrap(&self, stored: &Datum) -> Result<Datum, DomainError>;

    /// Presented form to stored form.
    fn unwrap(&self, presented: &Datum) -> Result<Datum, DomainError>;

    /// Canonical stored form used for comparison and storage. Identity except
    /// for floating-point keys.
    fn normalize(&self, stored: Datum) -> Datum {
        stored
    }

    fn equals(&self, a: &Datum, b: &Datum) -> bool;

    fn default_value(&self) -> Datum;

    fn sentinel_policy(&self) -> SentinelPolicy;
}

pub struct IntegralStrategy {
    width: Width,
    signed: bool,
}

static I8: IntegralStrategy = IntegralStrategy {
    width: Width::W8,
    signed: true,
};
static I16: IntegralStrategy = IntegralStrategy {
    width: Width::W16,
    signed: true,
};
static I32: IntegralStrategy = IntegralStrategy {
    width: Width::W32,
    signed: true,
};
static I64: IntegralStrategy = IntegralStrategy {
    width: Width::W64,
    signed: true,
};
static U8: IntegralStrategy = IntegralStrategy {
    width: Width::W8,
    signed: false,
};
static U16: IntegralStrategy = IntegralStrategy {
    width: Width::W16,
    signed: false,
};
static U32: IntegralStrategy = IntegralStrategy {
    width: Width::W32,
    signed: false,
};
static U64: IntegralStrategy = IntegralStrategy {
    width: Width::W64,
    signed: false,
};

impl IntegralStrategy {
    fn fits(&self, v: i64) -> bool {
        let bits = self.width.bits();
        match (self.signed, bits) {
            (_, 64) => true,
            (true, b) => {
                let half = 1i64 << (b - 1);
                (-half..half).contains(&v)
            }
            (false, b) => (0..(1i64 << b)).contains(&v),
        }
    }
}

impl DomainStrategy for IntegralStrategy {
    fn domain(&self) -> Domain {
        Domain::int(self.width, self.signed)
    }

    fn wrap(&self, stored: &Datum) -> Result<Datum, DomainError> {
        match stored {
            Datum::Bits(b) => {
                let shift = 64 - self.width.bits();
                let v = if self.signed {
                    ((*b << shift) as i64) >> shift
                } else {
                    *b as i64
                };
                Ok(Datum::Int(v))
            }
            other => Err(DomainError::Mismatch {
                expected: DomainCategory::Integral,
                found: other.clone(),
            }),
        }
    }

    fn unwrap(&self, presented: &Datum) -> Result<Datum, DomainError> {
        match presented {
            // u64 values above i64::MAX are presented in two's complement.
            Datum::Int(v) if self.fits(*v) => Ok(Datum::Bits(*v as u64 & self.width.mask())),
            Datum::Int(v) => Err(DomainError::OutOfRange {
                value: *v,
                domain: self.domain(),
            }),
            Datum::Bits(b) if b & !self.width.mask() == 0 => Ok(Datum::Bits(*b)),
            other => Err(DomainError::Mismatch {
                expected: DomainCategory::Integral,
                found: other.clone(),
            }),
        }
    }

    fn equals(&self, a: &Datum, b: &Datum) -> bool {
        a == b
    }

    fn default_value(&self) -> Datum {
        Datum::Int(0)
    }

    fn sentinel_policy(&self) -> SentinelPolicy {
        let free = self.width.sign_bit();
        SentinelPolicy::InBand {
            free,
            removed: free | 1,
            perturbation: Perturbation::Decrement,
        }
    }
}

pub struct FloatStrategy {
    width: FloatWidth,
}

static F32: FloatStrategy = FloatStrategy {
    width: FloatWidth::F32,
};
static F64: FloatStrategy = FloatStrategy {
    width: FloatWidth::F64,
};

impl DomainStrategy for FloatStrategy {
    fn domain(&self) -> Domain {
        Domain::FloatingPoint { width: self.width }
    }

    fn wrap(&self, stored: &Datum) -> Result<Datum, DomainError> {
        match (stored, self.width) {
            (Datum::Bits(b), FloatWidth::F32) => Ok(Datum::Float(f32::from_bits(*b as u32) as f64)),
            (Datum::Bits(b), FloatWidth::F64) => Ok(Datum::Float(f64::from_bits(*b))),
            (other, _) => Err(DomainError::Mismatch {
                expected: DomainCategory::FloatingPoint,
                found: other.clone(),
            }),
        }
    }

    fn unwrap(&self, presented: &Datum) -> Result<Datum, DomainError> {
        match (presented, self.width) {
            (Datum::Float(f), FloatWidth::F32) => {
                let narrowed = *f as f32;
                if narrowed.is_infinite() && f.is_finite() {
                    return Err(DomainError::FloatOverflow {
                        value: *f,
                        domain: self.domain(),
                    });
                }
                Ok(Datum::Bits(narrowed.to_bits() as u64))
            }
            (Datum::Float(f), FloatWidth::F64) => Ok(Datum::Bits(f.to_bits())),
            (Datum::Bits(b), w) if b & !w.width().mask() == 0 => Ok(Datum::Bits(*b)),
            (other, _) => Err(DomainError::Mismatch {
                expected: DomainCategory::FloatingPoint,
                found: other.clone(),
            }),
        }
    }

    /// Folds every NaN encoding into one pattern. Signed zeros stay distinct.
    fn normalize(&self, stored: Datum) -> Datum {
        match stored {
            Datum::Bits(b) if self.width.is_nan(b) => Datum::Bits(self.width.canonical_nan()),
            other => other,
        }
    }

    fn equals(&self, a: &Datum, b: &Datum) -> bool {
        a == b
    }

    fn default_value(&self) -> Datum {
        Datum::Float(0.0)
    }

    fn sentinel_policy(&self) -> SentinelPolicy {
        // Non-canonical NaNs: normalized keys never take these patterns.
        let nan = self.width.canonical_nan();
        SentinelPolicy::InBand {
            free: nan | 1,
            removed: nan | 2,
            perturbation: Perturbation::SignFlipThenDecrement,
        }
    }
}

pub struct ReferenceStrategy {
    nullable: bool,
}

static NULLABLE_REF: ReferenceStrategy = ReferenceStrategy { nullable: true };
static NON_NULL_REF: ReferenceStrategy = ReferenceStrategy { nullable: false };

impl DomainStrategy for ReferenceStrategy {
    fn domain(&self) -> Domain {
        Domain::reference(self.nullable)
    }

    fn wrap(&self, stored: &Datum) -> Result<Datum, DomainError> {
        match stored {
            Datum::Ref(_) => Ok(stored.clone()),
            other => Err(DomainError::Mismatch {
                expected: DomainCategory::Reference,
                found: other.clone(),
            }),
        }
    }

    fn unwrap(&self, presented: &Datum) -> Result<Datum, DomainError> {
        match presented {
            Datum::Ref(None) if !self.nullable => Err(DomainError::NullNotPermitted {
                domain: self.domain(),
            }),
            Datum::Ref(_) => Ok(presented.clone()),
            other => Err(DomainError::Mismatch {
                expected: DomainCategory::Reference,
                found: other.clone(),
            }),
        }
    }

    fn equals(&self, a: &Datum, b: &Datum) -> bool {
        match (a, b) {
            (Datum::Ref(None), Datum::Ref(None)) => true,
            (Datum::Ref(Some(x)), Datum::Ref(Some(y))) => Rc::ptr_eq(x, y) || x == y,
            _ => false,
        }
    }

    fn default_value(&self) -> Datum {
        Datum::Ref(None)
    }

    fn sentinel_policy(&self) -> SentinelPolicy {
        SentinelPolicy::OutOfBand
    }
}
