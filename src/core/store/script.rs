// src/core/store/script.rs

//! Lua scripts evaluated atomically by the store.

use sha1::{Digest, Sha1};

/// Makes scripts portable between Redis (`redis.call`) and SpinelDB
/// (`spinel.call`).
const PRELUDE: &str = "local redis = redis or spinel\n";

/// A script together with the SHA1 digest used for `EVALSHA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    source: String,
    sha1: String,
}

impl Script {
    pub fn new(body: &str) -> Self {
        let source = format!("{PRELUDE}{body}");
        let mut hasher = Sha1::new();
        hasher.update(source.as_bytes());
        let sha1 = hex::encode(hasher.finalize());
        Self { source, sha1 }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn sha1(&self) -> &str {
        &self.sha1
    }
}

/// Deletes `KEYS[1]` only if its value equals `ARGV[1]`. Returns the number of
/// keys deleted.
pub const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Deletes `KEYS[1]` if its value equals `ARGV[1]` and, in the same step,
/// removes field `ARGV[2]` from the hash `KEYS[2]`. Returns 1 if the record was
/// removed.
pub const COMPARE_AND_DELETE_WITH_INDEX: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    redis.call("HDEL", KEYS[2], ARGV[2])
    return 1
else
    return 0
end
"#;
