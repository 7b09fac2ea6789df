// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Identity of a table, stable across schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(Uuid);

impl TableId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The slice of table schema the admission core cares about: identity plus
/// the keyspace/table names used in diagnostics. The full schema object is
/// an external collaborator.
#[derive(Debug)]
pub struct Schema {
    id: TableId,
    keyspace: String,
    table: String,
}

pub type SchemaRef = Arc<Schema>;

impl Schema {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> SchemaRef {
        Arc::new(Self {
            id: TableId::new(),
            keyspace: keyspace.into(),
            table: table.into(),
        })
    }

    pub fn with_id(
        id: TableId,
        keyspace: impl Into<String>,
        table: impl Into<String>,
    ) -> SchemaRef {
        Arc::new(Self {
            id,
            keyspace: keyspace.into(),
            table: table.into(),
        })
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}
