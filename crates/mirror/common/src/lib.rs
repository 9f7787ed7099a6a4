pub mod envelope;
pub mod error;
mod framed;
pub mod limits;
pub mod value;

pub use self::framed::{classify_frame_error, FramedReader, FramedWriter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the implicit property-change event every DTO carries.
pub const PROPERTY_CHANGED: &str = "PropertyChanged";

macro_rules! make_uuid {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident;
    )*} => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        $vis struct $ident(Uuid);

        impl $ident {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses the canonical textual form (hyphenated lowercase).
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }

            pub fn uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    )*}
}

make_uuid! {
	/// Names a DTO across the wire. Minted by the server the first time an
	/// object is serialized; clients never mint one.
	pub struct DtoId;

	/// Correlates a request envelope with its response. Unique per session.
	pub struct MessageId;
}
