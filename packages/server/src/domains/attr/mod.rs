//! The typed attribute model.
//!
//! Every server object carries an array of attributes indexed by a
//! per-object definition table. Definitions fix the wire type, the
//! permission bits and the hook behavior (decode, encode, set, compare;
//! freeing is Rust's `Drop`). Values cross the wire as flat lists of
//! `(name, resource, value, flags, op)` entries and reach the store as
//! sparse `name.resource -> flags.value` pairs.

mod def;
mod list;
mod value;

pub use def::{atflag, perm, Attr, AttrArray, AttrDef};
pub use list::{put_wireattrs, read_wireattrs, take_wireattrs, write_wireattrs, WireAttr};
pub use value::{resource_type, AttrType, AttrValue, SetOp};
