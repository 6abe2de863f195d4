// src/db/migrations.rs
//! Database migration implementations
//!
//! Each function moves the schema up by exactly one version.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Initial schema - Version 1
///
/// Creates the installed-system tables:
/// - interned names, versions, branches, labels and flavors
/// - Instances: one row per installed (or referenced) trove
/// - TroveTroves: collection membership
/// - FileStreams / TroveFiles: file objects and which trove owns which path
/// - Dependencies / Provides / Requires
/// - TroveInfo: typed auxiliary blobs
pub fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE Items (
            itemId INTEGER PRIMARY KEY,
            item TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Versions (
            versionId INTEGER PRIMARY KEY,
            version TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Branches (
            branchId INTEGER PRIMARY KEY,
            branch TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Labels (
            labelId INTEGER PRIMARY KEY,
            label TEXT NOT NULL UNIQUE
        );

        -- Version graph: which labels and branches each name appears on
        CREATE TABLE LabelMap (
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            labelId INTEGER NOT NULL REFERENCES Labels(labelId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            UNIQUE(itemId, labelId, branchId)
        );

        CREATE TABLE Flavors (
            flavorId INTEGER PRIMARY KEY,
            flavor TEXT NOT NULL UNIQUE
        );
        INSERT INTO Flavors (flavorId, flavor) VALUES (0, '');

        -- One row per (flavor, dependency class, name, flag)
        CREATE TABLE FlavorMap (
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId) ON DELETE CASCADE,
            base TEXT NOT NULL,
            sense INTEGER NOT NULL,
            flag TEXT NOT NULL
        );
        CREATE INDEX FlavorMapIdx ON FlavorMap(flavorId);

        CREATE TABLE Instances (
            instanceId INTEGER PRIMARY KEY,
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            timeStamps TEXT NOT NULL,
            isPresent INTEGER NOT NULL DEFAULT 1,
            pinned INTEGER NOT NULL DEFAULT 0,
            troveType INTEGER NOT NULL DEFAULT 0,
            UNIQUE(itemId, versionId, flavorId)
        );
        CREATE INDEX InstancesItemIdx ON Instances(itemId);

        CREATE TABLE TroveTroves (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId) ON DELETE CASCADE,
            includedId INTEGER NOT NULL REFERENCES Instances(instanceId),
            flags INTEGER NOT NULL,
            inPristine INTEGER NOT NULL DEFAULT 1,
            UNIQUE(instanceId, includedId)
        );
        CREATE INDEX TroveTrovesIncludedIdx ON TroveTroves(includedId);

        CREATE TABLE FileStreams (
            streamId INTEGER PRIMARY KEY,
            fileId BLOB NOT NULL UNIQUE,
            stream BLOB NOT NULL,
            sha1 BLOB
        );
        CREATE INDEX FileStreamsSha1Idx ON FileStreams(sha1);

        CREATE TABLE TroveFiles (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId) ON DELETE CASCADE,
            streamId INTEGER NOT NULL REFERENCES FileStreams(streamId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            pathId BLOB NOT NULL,
            path TEXT NOT NULL,
            isPresent INTEGER NOT NULL DEFAULT 1,
            UNIQUE(instanceId, pathId)
        );
        CREATE INDEX TroveFilesPathIdx ON TroveFiles(path);
        CREATE INDEX TroveFilesStreamIdx ON TroveFiles(streamId);

        CREATE TABLE Tags (
            tagId INTEGER PRIMARY KEY,
            tag TEXT NOT NULL UNIQUE
        );

        CREATE TABLE TroveFileTags (
            streamId INTEGER NOT NULL REFERENCES FileStreams(streamId) ON DELETE CASCADE,
            tagId INTEGER NOT NULL REFERENCES Tags(tagId),
            UNIQUE(streamId, tagId)
        );
        CREATE INDEX TroveFileTagsTagIdx ON TroveFileTags(tagId);

        CREATE TABLE Dependencies (
            depId INTEGER PRIMARY KEY,
            class INTEGER NOT NULL,
            name TEXT NOT NULL,
            flag TEXT NOT NULL,
            UNIQUE(class, name, flag)
        );

        CREATE TABLE Provides (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId) ON DELETE CASCADE,
            depId INTEGER NOT NULL REFERENCES Dependencies(depId)
        );
        CREATE INDEX ProvidesInstanceIdx ON Provides(instanceId);
        CREATE INDEX ProvidesDepIdx ON Provides(depId);

        -- A requirement with N flags is N+1 rows sharing depNum: one
        -- base row plus one per flag; depCount is N+1
        CREATE TABLE Requires (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId) ON DELETE CASCADE,
            depId INTEGER NOT NULL REFERENCES Dependencies(depId),
            depNum INTEGER NOT NULL,
            depCount INTEGER NOT NULL
        );
        CREATE INDEX RequiresInstanceIdx ON Requires(instanceId);
        CREATE INDEX RequiresDepIdx ON Requires(depId);

        CREATE TABLE TroveInfo (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId) ON DELETE CASCADE,
            infoType INTEGER NOT NULL,
            data BLOB NOT NULL,
            UNIQUE(instanceId, infoType)
        );
        CREATE INDEX TroveInfoTypeIdx ON TroveInfo(infoType);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Version 2: cache of trove name pattern matches
///
/// Auto-pin patterns are regular expressions over trove names. Matching
/// every installed name against every pattern on each apply is wasteful, so
/// results are cached per (pattern, item) pair.
pub fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE CheckTroveCache (
            patternId INTEGER NOT NULL REFERENCES Items(itemId),
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            matches INTEGER NOT NULL,
            UNIQUE(patternId, itemId)
        );
        ",
    )?;

    info!("Schema version 2 created successfully");
    Ok(())
}
