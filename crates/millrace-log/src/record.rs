//! Record types carried by the log stream.

// Record types with derive macros
mod record_types {
    #![allow(missing_docs)] // Allow for derive-generated code

    use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

    /// Classification of a record on the stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
    pub enum RecordType {
        /// An instruction to be processed.
        Command,
        /// A fact produced by processing a command.
        Event,
        /// A command that was refused.
        Rejection,
    }

    /// One entry of a partition's log.
    ///
    /// Positions are strictly increasing and unique per partition; a
    /// record is never visible to readers before it is durable.
    #[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
    pub struct Record {
        /// Position in the partition's log.
        pub position: i64,
        /// Position of the record that caused this one (-1 if none).
        pub source_position: i64,
        /// Key of the entity the record concerns (-1 if none).
        pub key: i64,
        /// Record classification.
        pub record_type: RecordType,
        /// Opaque value-type discriminator.
        pub value_type: u16,
        /// Opaque intent discriminator.
        pub intent: u16,
        /// Opaque payload bytes.
        pub payload: Vec<u8>,
    }
}

pub use record_types::{Record, RecordType};

/// Position value used when a record has no source or key.
pub const NO_VALUE: i64 = -1;

impl Record {
    /// Returns true if this is a command.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    /// Returns true if this is an event.
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.record_type == RecordType::Event
    }

    /// Returns true if this is a rejection.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::Rejection
    }
}

/// What a producer submits; the log stream assigns the position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpec {
    /// Record classification.
    pub record_type: RecordType,
    /// Opaque value-type discriminator.
    pub value_type: u16,
    /// Opaque intent discriminator.
    pub intent: u16,
    /// Key of the entity the record concerns (-1 if none).
    pub key: i64,
    /// Position of the causing record (-1 if none).
    pub source_position: i64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl RecordSpec {
    /// Creates a command spec with no key and no source position.
    #[must_use]
    pub fn command(value_type: u16, intent: u16, payload: Vec<u8>) -> Self {
        Self {
            record_type: RecordType::Command,
            value_type,
            intent,
            key: NO_VALUE,
            source_position: NO_VALUE,
            payload,
        }
    }

    /// Creates an event spec with no key and no source position.
    #[must_use]
    pub fn event(value_type: u16, intent: u16, payload: Vec<u8>) -> Self {
        Self {
            record_type: RecordType::Event,
            value_type,
            intent,
            key: NO_VALUE,
            source_position: NO_VALUE,
            payload,
        }
    }

    /// Creates a rejection spec with no key and no source position.
    #[must_use]
    pub fn rejection(value_type: u16, intent: u16, payload: Vec<u8>) -> Self {
        Self {
            record_type: RecordType::Rejection,
            value_type,
            intent,
            key: NO_VALUE,
            source_position: NO_VALUE,
            payload,
        }
    }

    /// Sets the entity key.
    #[must_use]
    pub fn with_key(mut self, key: i64) -> Self {
        self.key = key;
        self
    }

    /// Sets the causing record's position.
    #[must_use]
    pub fn with_source_position(mut self, position: i64) -> Self {
        self.source_position = position;
        self
    }

    /// Materializes a record at the given position.
    #[must_use]
    pub fn into_record(self, position: i64) -> Record {
        Record {
            position,
            source_position: self.source_position,
            key: self.key,
            record_type: self.record_type,
            value_type: self.value_type,
            intent: self.intent,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_constructors() {
        let spec = RecordSpec::command(3, 7, b"payload".to_vec());
        assert_eq!(spec.record_type, RecordType::Command);
        assert_eq!(spec.key, NO_VALUE);
        assert_eq!(spec.source_position, NO_VALUE);

        let spec = RecordSpec::event(1, 2, vec![]).with_key(42).with_source_position(9);
        assert_eq!(spec.key, 42);
        assert_eq!(spec.source_position, 9);

        let spec = RecordSpec::rejection(1, 2, vec![]);
        assert_eq!(spec.record_type, RecordType::Rejection);
    }

    #[test]
    fn test_into_record() {
        let record = RecordSpec::command(3, 7, b"x".to_vec())
            .with_key(5)
            .into_record(100);
        assert_eq!(record.position, 100);
        assert_eq!(record.key, 5);
        assert!(record.is_command());
        assert!(!record.is_event());
        assert!(!record.is_rejection());
        assert_eq!(record.payload, b"x");
    }
}
