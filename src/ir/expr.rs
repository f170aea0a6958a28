//! The expression tree (C1): the value-level IR that instructions read and
//! write. Expressions are immutable trees; rewrites replace a node with a
//! freshly built one rather than mutating in place.

use crate::common::{sign_extend_bits, signed_div, signed_gt, signed_lt, signed_mod, unsigned_div, unsigned_mod, Id, Word};
use crate::vmcall::VmCall;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity for a `Var`. Two `Var`s are the same variable iff their ids
/// match; unlike every other expression kind, `Var` carries no structural
/// payload; deliberately comparing it is the only place equality falls back
/// to identity instead of shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(u64);

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);

impl VarId {
    pub fn fresh() -> VarId {
        VarId(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Lit(Word),
    Var(VarId),
    /// A reference to a slot on the virtual stack, relative to the current
    /// basic block's entry. Only meaningful before a function's stack
    /// variables have been flattened into `Var`s (see `functions::flatten`).
    Stack(i64),
    Mem {
        address: Box<Expr>,
        length: Box<Expr>,
    },
    Storage {
        address: Box<Expr>,
    },
    /// `storage[sha3(offset . mapping_num)]`, recognized by a rewrite from a
    /// raw `Storage` access.
    MappingAccess { mapping_num: u64, offset: Box<Expr> },
    /// `storage[sha3(array_num) + offset]`, recognized the same way.
    ArrayAccess { array_num: u64, offset: Box<Expr> },
    /// A named, well-known environment value (`block.coinbase`, `msg.sender`, ...).
    GlobalVar(Id),
    /// The result of an assignment nobody reads; kept explicit so dead-code
    /// elimination has something concrete to look for instead of inferring
    /// "unused" from absence.
    UnusedValue,
    Sequence(Vec<Expr>),
    /// A call to a read-only vmcall (`sha3`, `calldataload`) used as a value.
    PureFunctionCall { name: VmCall, args: Vec<Expr> },
    BinaryOp(BinOp, Box<Expr>, Box<Expr>),
    UnaryOp(UnOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    SDiv,
    Mod,
    SMod,
    Exp,
    Lt,
    Gt,
    SLt,
    SGt,
    Eq,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Byte,
    SignExtend,
    AddMod3,
    MulMod3,
}

impl BinOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::Eq | BinOp::And | BinOp::Or | BinOp::Xor
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div | BinOp::SDiv => "/",
            BinOp::Mod | BinOp::SMod => "%",
            BinOp::Exp => "**",
            BinOp::Lt | BinOp::SLt => "<",
            BinOp::Gt | BinOp::SGt => ">",
            BinOp::Eq => "==",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr | BinOp::Sar => ">>",
            BinOp::Byte => "byte",
            BinOp::SignExtend => "signextend",
            BinOp::AddMod3 => "addmod",
            BinOp::MulMod3 => "mulmod",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    /// Logical negation: `!x`. Typically arises from `ISZERO`.
    Not,
    /// Bitwise complement of all 256 bits.
    BitNot,
}

/// Masks `expr.py`'s `And.casts` table recognizes when rendering an `And`
/// as a narrowing cast instead of a raw bitmask, keyed by the mask value.
pub fn and_cast_name(mask: Word) -> Option<&'static str> {
    let all_ones: Word = Word::MAX;
    let address_mask = all_ones >> (256 - 160); // 0xfff...f, 20 bytes of ones
    let byte_mask = Word::from(0xffu64);
    if mask == address_mask {
        Some("address")
    } else if mask == !address_mask {
        Some("remaddrbits")
    } else if mask == byte_mask {
        Some("byte")
    } else {
        None
    }
}

impl Expr {
    pub fn lit(v: impl Into<Word>) -> Expr {
        Expr::Lit(v.into())
    }

    pub fn fresh_var() -> Expr {
        Expr::Var(VarId::fresh())
    }

    pub fn is_lit(&self) -> bool {
        matches!(self, Expr::Lit(_))
    }

    pub fn as_lit(&self) -> Option<Word> {
        match self {
            Expr::Lit(w) => Some(*w),
            _ => None,
        }
    }

    /// Evaluate a purely constant expression (no `Var`/`Stack`/`Mem`/etc),
    /// used by constant folding. Returns `None` if any leaf isn't a literal.
    pub fn evaluate_const(&self) -> Option<Word> {
        match self {
            Expr::Lit(w) => Some(*w),
            Expr::UnaryOp(op, inner) => {
                let v = inner.evaluate_const()?;
                Some(match op {
                    UnOp::Not => {
                        if v == Word::ZERO {
                            Word::from(1u8)
                        } else {
                            Word::ZERO
                        }
                    }
                    UnOp::BitNot => !v,
                })
            }
            Expr::BinaryOp(op, a, b) => {
                let a = a.evaluate_const()?;
                let b = b.evaluate_const()?;
                Some(eval_binop(*op, a, b))
            }
            _ => None,
        }
    }

    /// Child expressions, in a stable order, for generic tree-walking
    /// rewrites (`utils.visit_and_modify_expressions` in the original).
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Lit(_) | Expr::Var(_) | Expr::Stack(_) | Expr::GlobalVar(_) | Expr::UnusedValue => vec![],
            Expr::Mem { address, length } => vec![address, length],
            Expr::Storage { address } => vec![address],
            Expr::MappingAccess { offset, .. } => vec![offset],
            Expr::ArrayAccess { offset, .. } => vec![offset],
            Expr::Sequence(items) => items.iter().collect(),
            Expr::PureFunctionCall { args, .. } => args.iter().collect(),
            Expr::BinaryOp(_, a, b) => vec![a, b],
            Expr::UnaryOp(_, a) => vec![a],
        }
    }

    /// Apply `f` to every child expression (not to `self`), returning a new
    /// node. Used to implement bottom-up rewrite passes.
    pub fn map_children(&self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        match self.clone() {
            Expr::Mem { address, length } => Expr::Mem {
                address: Box::new(f(*address)),
                length: Box::new(f(*length)),
            },
            Expr::Storage { address } => Expr::Storage {
                address: Box::new(f(*address)),
            },
            Expr::MappingAccess { mapping_num, offset } => Expr::MappingAccess {
                mapping_num,
                offset: Box::new(f(*offset)),
            },
            Expr::ArrayAccess { array_num, offset } => Expr::ArrayAccess {
                array_num,
                offset: Box::new(f(*offset)),
            },
            Expr::Sequence(items) => Expr::Sequence(items.into_iter().map(f).collect()),
            Expr::PureFunctionCall { name, args } => Expr::PureFunctionCall {
                name,
                args: args.into_iter().map(f).collect(),
            },
            Expr::BinaryOp(op, a, b) => Expr::BinaryOp(op, Box::new(f(*a)), Box::new(f(*b))),
            Expr::UnaryOp(op, a) => Expr::UnaryOp(op, Box::new(f(*a))),
            leaf => leaf,
        }
    }
}

pub fn eval_binop(op: BinOp, a: Word, b: Word) -> Word {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => unsigned_div(a, b),
        BinOp::SDiv => signed_div(a, b),
        BinOp::Mod => unsigned_mod(a, b),
        BinOp::SMod => signed_mod(a, b),
        BinOp::Exp => a.wrapping_pow(b),
        BinOp::Lt => bool_word(a < b),
        BinOp::Gt => bool_word(a > b),
        BinOp::SLt => bool_word(signed_lt(a, b)),
        BinOp::SGt => bool_word(signed_gt(a, b)),
        BinOp::Eq => bool_word(a == b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(shift_amount(b)),
        BinOp::Shr => a.wrapping_shr(shift_amount(b)),
        BinOp::Sar => arithmetic_shift_right(a, b),
        BinOp::Byte => byte_at(a, b),
        BinOp::SignExtend => {
            let nbytes = a;
            if nbytes >= Word::from(32u8) {
                b
            } else {
                let bits = (nbytes.to::<u64>() as u32 + 1) * 8;
                sign_extend_bits(b, bits)
            }
        }
        // the 3-ary forms carry their modulus via the `b` slot packed with a
        // Sequence upstream; plain eval_binop never sees them directly.
        BinOp::AddMod3 | BinOp::MulMod3 => a,
    }
}

fn shift_amount(b: Word) -> usize {
    if b > Word::from(255u16) {
        256
    } else {
        b.to::<usize>()
    }
}

fn arithmetic_shift_right(value: Word, shift: Word) -> Word {
    if crate::common::is_negative(value) {
        let amount = shift_amount(shift);
        if amount >= 256 {
            return Word::MAX;
        }
        let shifted = value.wrapping_shr(amount);
        let fill = if amount == 0 { Word::ZERO } else { Word::MAX.wrapping_shl(256 - amount) };
        shifted | fill
    } else {
        value.wrapping_shr(shift_amount(shift))
    }
}

fn byte_at(index: Word, value: Word) -> Word {
    if index >= Word::from(32u8) {
        return Word::ZERO;
    }
    let i = index.to::<usize>();
    let shift = (31 - i) * 8;
    (value.wrapping_shr(shift)) & Word::from(0xffu64)
}

fn bool_word(b: bool) -> Word {
    if b {
        Word::from(1u8)
    } else {
        Word::ZERO
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Lit(w) => write!(f, "0x{:x}", w),
            Expr::Var(id) => write!(f, "var{}", id.0),
            Expr::Stack(off) => write!(f, "stack[{}]", off),
            Expr::Mem { address, length } => write!(f, "mem({}, {})", address, length),
            Expr::Storage { address } => write!(f, "storage[{}]", address),
            Expr::MappingAccess { mapping_num, offset } => {
                write!(f, "mapping{}[{}]", mapping_num, offset)
            }
            Expr::ArrayAccess { array_num, offset } => write!(f, "array{}[{}]", array_num, offset),
            Expr::GlobalVar(name) => write!(f, "{}", name),
            Expr::UnusedValue => write!(f, "<unused>"),
            Expr::Sequence(items) => {
                write!(f, "(")?;
                for (i, e) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Expr::PureFunctionCall { name, args } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::UnaryOp(UnOp::Not, inner) => {
                // print `a != b` rather than `!(a == b)`.
                if let Expr::BinaryOp(BinOp::Eq, a, b) = inner.as_ref() {
                    write!(f, "({} != {})", a, b)
                } else {
                    write!(f, "!({})", inner)
                }
            }
            Expr::UnaryOp(UnOp::BitNot, inner) => write!(f, "~({})", inner),
            Expr::BinaryOp(BinOp::And, a, b) => {
                if let Some(name) = a.as_lit().and_then(and_cast_name) {
                    write!(f, "{}({})", name, b)
                } else if let Some(name) = b.as_lit().and_then(and_cast_name) {
                    write!(f, "{}({})", name, a)
                } else {
                    write!(f, "({} & {})", a, b)
                }
            }
            Expr::BinaryOp(op, a, b) => write!(f, "({} {} {})", a, op.symbol(), b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_eq_renders_as_not_equal() {
        let e = Expr::UnaryOp(
            UnOp::Not,
            Box::new(Expr::BinaryOp(BinOp::Eq, Box::new(Expr::lit(1u64)), Box::new(Expr::lit(2u64)))),
        );
        assert_eq!(format!("{}", e), "(0x1 != 0x2)");
    }

    #[test]
    fn and_with_address_mask_renders_as_cast() {
        let mask = Word::MAX >> (256 - 160);
        let e = Expr::BinaryOp(BinOp::And, Box::new(Expr::Lit(mask)), Box::new(Expr::fresh_var()));
        assert!(format!("{}", e).starts_with("address("));
    }

    #[test]
    fn var_equality_is_by_identity_not_shape() {
        let a = Expr::fresh_var();
        let b = Expr::fresh_var();
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn stack_equality_is_structural() {
        assert_eq!(Expr::Stack(-2), Expr::Stack(-2));
        assert_ne!(Expr::Stack(-2), Expr::Stack(-1));
    }

    #[test]
    fn const_fold_add() {
        let e = Expr::BinaryOp(BinOp::Add, Box::new(Expr::lit(2u64)), Box::new(Expr::lit(3u64)));
        assert_eq!(e.evaluate_const(), Some(Word::from(5u64)));
    }

    #[test]
    fn div_by_zero_folds_to_zero() {
        let e = Expr::BinaryOp(BinOp::Div, Box::new(Expr::lit(5u64)), Box::new(Expr::lit(0u64)));
        assert_eq!(e.evaluate_const(), Some(Word::ZERO));
    }

    #[test]
    fn signextend_one_byte_negative() {
        let e = Expr::BinaryOp(BinOp::SignExtend, Box::new(Expr::lit(0u64)), Box::new(Expr::lit(0xffu64)));
        assert_eq!(e.evaluate_const(), Some(Word::MAX));
    }
}
