//! Bitsets attached to handlers and operations.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$flag_meta:meta])* const $flag:ident = $bit:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u16);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$flag_meta])* pub const $flag: Self = Self(1 << $bit);)*

            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            #[must_use]
            pub const fn without(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $(
                    if self.contains(Self::$flag) {
                        names.push(stringify!($flag));
                    }
                )*
                if names.is_empty() {
                    write!(f, "{}(NONE)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), names.join(" | "))
                }
            }
        }
    };
}

flag_set! {
    /// Behaviour switches carried by a handler and widened by decorators.
    pub struct RequestFlags {
        /// Ask the server to keep the connection open after the response.
        const KEEP_ALIVE = 0;
        /// Force `Connection: close` on the response.
        const CLOSE_CONNECTION = 1;
        /// The request must not carry a body.
        const NO_BODY = 2;
        /// The client sets Content-Length explicitly.
        const EXPLICITLY_SET_LENGTH = 3;
        /// The request arrived through a redirect.
        const REDIRECTED = 4;
        /// The request was a POST turned into a GET by a redirect.
        const REDIRECTED_AS_GET = 5;
        /// The request must not carry a Content-Length header.
        const NO_CONTENT_LENGTH = 6;
    }
}

flag_set! {
    /// Connection and fault-injection switches of a single operation.
    pub struct OperationFlags {
        /// Never take a pooled connection and never return ours to the pool.
        const DONT_REUSE_CONNECTION = 0;
        /// Never take a pooled connection.
        const FORCE_NEW_CONNECTION = 1;
        /// Only the client side decides the outcome; server-side faults are ignored.
        const ABORT_AFTER_CLIENT_EXITS = 2;
        /// The server resets the socket right after accepting it.
        const SERVER_ABORTS_HANDSHAKE = 3;
        /// The client abandons the request right after writing it.
        const CLIENT_ABORTS_REQUEST = 4;
        /// Admission is requested only after `admit()` is called.
        const DELAYED_ADMISSION = 5;
    }
}

impl OperationFlags {
    pub const fn may_take_pooled(self) -> bool {
        !self.intersects(Self::DONT_REUSE_CONNECTION.union(Self::FORCE_NEW_CONNECTION))
    }

    pub const fn may_park(self) -> bool {
        !self.contains(Self::DONT_REUSE_CONNECTION)
    }
}
