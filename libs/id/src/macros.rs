//! The `define_id!` macro.

/// Declares an id kind and a `Copy` alias of [`Id`](crate::Id) for it.
///
/// ```ignore
/// define_id!(DcId, DcKind, "dc");
///
/// let dc = DcId::new();
/// let parsed: DcId = dc.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $alias:ident, $kind:ident, $prefix:literal) => {
        #[doc = concat!("Kind marker for `", $prefix, "_` identifiers.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $kind {}

        impl $crate::IdKind for $kind {
            const PREFIX: &'static str = $prefix;
        }

        $(#[$meta])*
        pub type $alias = $crate::Id<$kind>;
    };
}
