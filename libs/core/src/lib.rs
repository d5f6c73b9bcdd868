//! Courier Core - the serialization boundary shared by courier crates
//!
//! A [`Serializer`] turns application values into payload bytes and back.
//! The session engine in `courier-fabric` treats it as an opaque capability,
//! so plugins only need to depend on this crate.
//!
//! # Example
//!
//! ```
//! use courier_core::{Serializer, StringSerializer};
//!
//! let serializer = StringSerializer;
//! let bytes = serializer.encode(&"hello".to_string()).unwrap();
//! assert_eq!(serializer.decode(&bytes).unwrap(), "hello");
//! ```

pub mod error;
pub mod serializer;

pub use error::{Error, Result};
pub use serializer::{BincodeSerializer, JsonSerializer, RawSerializer, Serializer, StringSerializer};
