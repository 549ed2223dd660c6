//! Identifier generation for Flushline.
//!
//! `flushline-id` reserves blocks of primary-key values from a shared counter
//! table and slices them into individual identifiers.
//!
//! - [`TableGenerator`] speaks the select / compare-and-swap protocol against
//!   the counter table, retrying when another allocator wins the race.
//! - [`BlockIdentifierGenerator`] hands out ids from the reserved block and
//!   only goes back to the database when the block is exhausted.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = TableGeneratorConfig::new("hibernate_sequences").segment("heroes");
//! let generator = BlockIdentifierGenerator::new(TableGenerator::new(config, conn.dialect())?);
//! let id = generator.generate(&cx, &conn).await;
//! ```

pub mod generator;
pub mod table;

pub use generator::{BlockAllocator, BlockIdentifierGenerator};
pub use table::TableGenerator;
