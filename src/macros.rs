/// Non-exhaustive enum whose variants map one-to-one onto wire names.
///
/// Expands to the enum plus `as_str()`, a `VARIANTS` table, `Display`,
/// `AsRef<str>` and a `FromStr` that ignores ASCII case. Extra derives and
/// attributes given on the enum are passed through. The caller declares the
/// parse error, a tuple struct holding the rejected input.
///
/// ```ignore
/// wire_enum! {
///     error_type: ParseColorError,
///     pub enum Color {
///         Red => "RED",
///     }
/// }
/// ```
macro_rules! wire_enum {
    (
        error_type: $Err:ident,
        $(#[$enum_meta:meta])*
        $vis:vis enum $Name:ident {
            $(
                $(#[$var_meta:meta])*
                $variant:ident => $wire:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        $vis enum $Name {
            $(
                $(#[$var_meta])*
                $variant,
            )+
        }

        impl $Name {
            /// All variants in declaration order.
            pub const VARIANTS: &'static [$Name] = &[$( $Name::$variant, )+];

            /// Name as written on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $Name::$variant => $wire, )+
                }
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $Name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::str::FromStr for $Name {
            type Err = $Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::VARIANTS
                    .iter()
                    .copied()
                    .find(|v| s.eq_ignore_ascii_case(v.as_str()))
                    .ok_or_else(|| $Err(s.to_string()))
            }
        }
    };
}

/// Parse error for a [`wire_enum!`] type: `Display` reads `unknown <what>: <input>`.
macro_rules! wire_parse_error {
    ($(#[$meta:meta])* $vis:vis struct $Err:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis struct $Err(pub String);

        impl std::fmt::Display for $Err {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!("unknown ", $what, ": {}"), self.0)
            }
        }

        impl std::error::Error for $Err {}
    };
}
