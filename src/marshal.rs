//! Type-token marshalling between typed values and [`WireValue`]s.
//!
//! The type descriptor of a value is its Rust type; serde supplies the codec
//! callbacks. Positional argument lists are modelled as tuples so a call site
//! reads `client.invoke("Add", (2, 3))` and a handler takes `|(a, b): (i32,
//! i32)|`. Tuples of up to eight elements are supported; an explicit
//! `Vec<WireValue>` bypasses the arity sugar entirely.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Result, RpcError, WireValue};

/// Marshal one value at position `index`.
///
/// # Errors
///
/// Returns [`RpcError::Marshal`] carrying `index` if serialization fails.
pub fn to_wire<T>(index: usize, value: &T) -> Result<WireValue>
where
    T: Serialize + ?Sized,
{
    serde_json::to_value(value).map_err(|source| RpcError::Marshal { index, source })
}

/// Decode one wire value at position `index` into `T`.
///
/// # Errors
///
/// Returns [`RpcError::Decode`] carrying `index` if deserialization fails.
pub fn from_wire<T>(index: usize, value: WireValue) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(value).map_err(|source| RpcError::Decode { index, source })
}

/// Ordered positional arguments of an outbound call.
///
/// Marshalling is all-or-nothing: the first failing argument aborts the
/// whole list, so a malformed call never reaches the connection.
pub trait HubArgs {
    /// Marshal every argument, preserving order.
    fn into_arguments(self) -> Result<Vec<WireValue>>;
}

/// Positional parameters of an inbound handler.
pub trait FromArguments: Sized {
    /// Number of positional parameters.
    const ARITY: usize;

    /// Decode arguments positionally.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ArgumentCount`] if the argument count differs from
    /// [`Self::ARITY`], or [`RpcError::Decode`] for the first argument that
    /// fails to decode.
    fn from_arguments(arguments: Vec<WireValue>) -> Result<Self>;
}

fn check_arity(expected: usize, actual: usize) -> Result<()> {
    // ---
    if expected == actual {
        Ok(())
    } else {
        Err(RpcError::ArgumentCount { expected, actual })
    }
}

impl HubArgs for Vec<WireValue> {
    fn into_arguments(self) -> Result<Vec<WireValue>> {
        Ok(self)
    }
}

impl HubArgs for () {
    fn into_arguments(self) -> Result<Vec<WireValue>> {
        Ok(Vec::new())
    }
}

impl FromArguments for () {
    const ARITY: usize = 0;

    fn from_arguments(arguments: Vec<WireValue>) -> Result<Self> {
        check_arity(Self::ARITY, arguments.len())
    }
}

macro_rules! impl_positional {
    ($arity:expr => $($idx:tt $ty:ident),+) => {
        impl<$($ty),+> HubArgs for ($($ty,)+)
        where
            $($ty: Serialize,)+
        {
            fn into_arguments(self) -> Result<Vec<WireValue>> {
                Ok(vec![$(to_wire($idx, &self.$idx)?),+])
            }
        }

        impl<$($ty),+> FromArguments for ($($ty,)+)
        where
            $($ty: DeserializeOwned,)+
        {
            const ARITY: usize = $arity;

            fn from_arguments(arguments: Vec<WireValue>) -> Result<Self> {
                check_arity(Self::ARITY, arguments.len())?;
                let mut values = arguments.into_iter();
                Ok(($(from_wire::<$ty>($idx, values.next().unwrap_or(WireValue::Null))?,)+))
            }
        }
    };
}

impl_positional!(1 => 0 A);
impl_positional!(2 => 0 A, 1 B);
impl_positional!(3 => 0 A, 1 B, 2 C);
impl_positional!(4 => 0 A, 1 B, 2 C, 3 D);
impl_positional!(5 => 0 A, 1 B, 2 C, 3 D, 4 E);
impl_positional!(6 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
impl_positional!(7 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G);
impl_positional!(8 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H);
