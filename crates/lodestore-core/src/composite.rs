//! Record derivation for user composites
//!
//! [`record_struct!`] implements [`Record`](crate::Record) for a struct as
//! the concatenation of its listed members, in declared order: the same
//! layout as a tuple of those members. [`record_enum!`] implements the
//! sum-type encoding: a one-byte discriminant followed by the selected
//! alternative. [`partial_record_struct!`] declares a full and a partial
//! member list; event records carry a one-byte header selecting between
//! them, while snapshots always serialize the full list with no header.
//!
//! The discriminant byte limits enums to 256 alternatives; a wider literal
//! fails to compile at the macro instantiation.

/// Event-record header: all members follow.
pub const EVENT_FULL: u8 = 0x00;
/// Event-record header: the partial member list follows.
pub const EVENT_PARTIAL: u8 = 0x01;
/// Event-record header: no members follow (empty/erased object).
pub const EVENT_EMPTY: u8 = 0x02;

/// Implement `Record` for a struct over the listed fields, in order.
///
/// The type must implement `Default`, and its default must be the empty
/// value of every listed field.
///
/// ```ignore
/// #[derive(Default)]
/// struct Session { id: u64, peer: String }
/// record_struct!(Session { id, peer });
/// ```
#[macro_export]
macro_rules! record_struct {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::Record for $ty {
            fn empty() -> Self {
                <$ty as ::core::default::Default>::default()
            }

            fn encoded_size(&self) -> usize {
                0 $(+ $crate::Record::encoded_size(&self.$field))+
            }

            fn is_empty(&self) -> bool {
                true $(&& $crate::Record::is_empty(&self.$field))+
            }

            fn write(&self, dst: &mut [u8]) -> $crate::StoreResult<usize> {
                $crate::serial::compose_write(dst, |w| {
                    $(w.write(&self.$field)?;)+
                    Ok(())
                })
            }

            fn read(&mut self, src: &[u8]) -> $crate::StoreResult<usize> {
                $crate::serial::compose_read(src, |r| {
                    $(r.read(&mut self.$field)?;)+
                    Ok(())
                })
            }
        }
    };
}

/// Implement `Record` for an enum of single-payload variants.
///
/// Each alternative is written as its u8 discriminant followed by the
/// payload encoding; the first listed variant (with an empty payload) is
/// the empty value. An unknown discriminant in the stream is a decode
/// error.
///
/// ```ignore
/// enum Route { Direct(u32), Relayed(String) }
/// record_enum!(Route { 0 => Direct(u32), 1 => Relayed(String) });
/// ```
#[macro_export]
macro_rules! record_enum {
    ($ty:ident {
        $first_tag:literal => $first_var:ident($first_inner:ty)
        $(, $tag:literal => $var:ident($inner:ty))* $(,)?
    }) => {
        impl $crate::Record for $ty {
            fn empty() -> Self {
                $ty::$first_var(<$first_inner as $crate::Record>::empty())
            }

            fn encoded_size(&self) -> usize {
                1 + match self {
                    $ty::$first_var(v) => $crate::Record::encoded_size(v),
                    $($ty::$var(v) => $crate::Record::encoded_size(v),)*
                }
            }

            fn is_empty(&self) -> bool {
                match self {
                    $ty::$first_var(v) => $crate::Record::is_empty(v),
                    $($ty::$var(v) => $crate::Record::is_empty(v),)*
                }
            }

            fn write(&self, dst: &mut [u8]) -> $crate::StoreResult<usize> {
                let required = $crate::Record::encoded_size(self);
                if dst.len() < required {
                    return Ok(required);
                }
                match self {
                    $ty::$first_var(v) => {
                        dst[0] = $first_tag;
                        $crate::Record::write(v, &mut dst[1..])?;
                    }
                    $($ty::$var(v) => {
                        dst[0] = $tag;
                        $crate::Record::write(v, &mut dst[1..])?;
                    })*
                }
                Ok(required)
            }

            fn read(&mut self, src: &[u8]) -> $crate::StoreResult<usize> {
                if src.is_empty() {
                    return Ok(1);
                }
                match src[0] {
                    $first_tag => {
                        let mut v = <$first_inner as $crate::Record>::empty();
                        let used = $crate::Record::read(&mut v, &src[1..])?;
                        if used <= src.len() - 1 {
                            *self = $ty::$first_var(v);
                        }
                        Ok(1 + used)
                    }
                    $($tag => {
                        let mut v = <$inner as $crate::Record>::empty();
                        let used = $crate::Record::read(&mut v, &src[1..])?;
                        if used <= src.len() - 1 {
                            *self = $ty::$var(v);
                        }
                        Ok(1 + used)
                    })*
                    other => Err($crate::StoreError::Decode {
                        reason: format!(
                            "invalid discriminant {} for {}",
                            other,
                            stringify!($ty)
                        ),
                    }),
                }
            }
        }
    };
}

/// Implement `Record` for a struct with full and partial member lists.
///
/// Event records are prefixed with a header byte (`0x00` full, `0x01`
/// partial, `0x02` empty) and by default carry only the partial list.
/// Snapshot writes (and replays) always use the full list with no header,
/// so fields outside the partial list survive on disk across partial
/// updates. [`EncodeContext::set_force_full`](crate::EncodeContext)
/// switches event records to the full list.
///
/// ```ignore
/// #[derive(Default)]
/// struct Device { id: u64, firmware: Bytes, counter: u64 }
/// partial_record_struct!(Device {
///     full: [id, firmware, counter],
///     partial: [id, counter],
/// });
/// ```
#[macro_export]
macro_rules! partial_record_struct {
    ($ty:ty {
        full: [$($full:ident),+ $(,)?],
        partial: [$($part:ident),+ $(,)?] $(,)?
    }) => {
        impl $crate::Record for $ty {
            fn empty() -> Self {
                <$ty as ::core::default::Default>::default()
            }

            fn is_empty(&self) -> bool {
                true $(&& $crate::Record::is_empty(&self.$full))+
            }

            fn encoded_size(&self) -> usize {
                let ctx = $crate::EncodeContext::current();
                if ctx.snapshot {
                    0 $(+ $crate::Record::encoded_size(&self.$full))+
                } else if $crate::Record::is_empty(self) {
                    1
                } else if ctx.force_full {
                    1 $(+ $crate::Record::encoded_size(&self.$full))+
                } else {
                    1 $(+ $crate::Record::encoded_size(&self.$part))+
                }
            }

            fn write(&self, dst: &mut [u8]) -> $crate::StoreResult<usize> {
                let ctx = $crate::EncodeContext::current();
                if ctx.snapshot {
                    return $crate::serial::compose_write(dst, |w| {
                        $(w.write(&self.$full)?;)+
                        Ok(())
                    });
                }
                if $crate::Record::is_empty(self) {
                    if !dst.is_empty() {
                        dst[0] = $crate::composite::EVENT_EMPTY;
                    }
                    return Ok(1);
                }
                if ctx.force_full {
                    $crate::serial::compose_write(dst, |w| {
                        w.write(&$crate::composite::EVENT_FULL)?;
                        $(w.write(&self.$full)?;)+
                        Ok(())
                    })
                } else {
                    $crate::serial::compose_write(dst, |w| {
                        w.write(&$crate::composite::EVENT_PARTIAL)?;
                        $(w.write(&self.$part)?;)+
                        Ok(())
                    })
                }
            }

            fn read(&mut self, src: &[u8]) -> $crate::StoreResult<usize> {
                let ctx = $crate::EncodeContext::current();
                if ctx.snapshot {
                    return $crate::serial::compose_read(src, |r| {
                        $(r.read(&mut self.$full)?;)+
                        Ok(())
                    });
                }
                if src.is_empty() {
                    return Ok(1);
                }
                match src[0] {
                    $crate::composite::EVENT_EMPTY => {
                        *self = <Self as $crate::Record>::empty();
                        Ok(1)
                    }
                    $crate::composite::EVENT_FULL => {
                        let used = $crate::serial::compose_read(&src[1..], |r| {
                            $(r.read(&mut self.$full)?;)+
                            Ok(())
                        })?;
                        Ok(1 + used)
                    }
                    $crate::composite::EVENT_PARTIAL => {
                        let used = $crate::serial::compose_read(&src[1..], |r| {
                            $(r.read(&mut self.$part)?;)+
                            Ok(())
                        })?;
                        Ok(1 + used)
                    }
                    other => Err($crate::StoreError::Decode {
                        reason: format!("invalid partial-encoding header {:#04x}", other),
                    }),
                }
            }
        }
    };
}
