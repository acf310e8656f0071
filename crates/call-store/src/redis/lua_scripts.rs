//! Lua scripts for the Redis store backend.
//!
//! Each script runs atomically on the server, which is what gives the
//! backend its transaction semantics: preconditions are checked and all
//! writes applied without any other client interleaving.
//!
//! # Key Layout
//!
//! All keys are prefixed with `ARGV[1]`:
//! - `doc:{path}` - document body (JSON string)
//! - `rev:{path}` - revision of a document, collection or sequence key
//! - `idx:{collection}` - set of document ids in a collection
//! - `seq:{path}` - append-only sequence (list of JSON strings)
//! - `clock` - store-wide revision counter

/// Atomic batch commit.
///
/// Arguments:
/// - ARGV[1]: Key prefix
/// - ARGV[2]: Request JSON `{"pre": [{"key", "rev"}], "writes": [...]}`
///
/// Each write is `{"op", "key", "collection"?, "id"?, "fields"?}` with `op`
/// one of `set`, `merge`, `update`, `delete`, `append`. Field values are
/// `{"v": value}`, `{"ts": true}` (server timestamp) or `{"inc": n}`.
///
/// Returns:
/// - `{1, revision}`: Success (all writes applied)
/// - `{0, key}`: Conflict (precondition on `key` failed, nothing written)
/// - `{-2, key}`: Not found (update of absent document, nothing written)
pub const COMMIT: &str = r#"
local prefix = ARGV[1]
local req = cjson.decode(ARGV[2])

-- Check every precondition before touching anything
for _, p in ipairs(req.pre) do
    local current = tonumber(redis.call('GET', prefix .. 'rev:' .. p.key) or '0')
    if current ~= tonumber(p.rev) then
        return {0, p.key}
    end
end

-- Updates require the document to exist (counting earlier writes in this batch)
local present = {}
for _, w in ipairs(req.writes) do
    if w.op == 'set' or w.op == 'merge' then
        present[w.key] = true
    elseif w.op == 'delete' then
        present[w.key] = false
    elseif w.op == 'update' then
        local exists = present[w.key]
        if exists == nil then
            exists = redis.call('EXISTS', prefix .. 'doc:' .. w.key) == 1
        end
        if not exists then
            return {-2, w.key}
        end
    end
end

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local rev = redis.call('INCR', prefix .. 'clock')

local function apply(doc, fields)
    for name, f in pairs(fields) do
        if f.ts then
            doc[name] = now
        elseif f.inc then
            doc[name] = (tonumber(doc[name]) or 0) + f.inc
        else
            doc[name] = f.v
        end
    end
    return doc
end

local function load(key)
    local raw = redis.call('GET', prefix .. 'doc:' .. key)
    if raw then
        return cjson.decode(raw)
    end
    return {}
end

local function bump(key)
    redis.call('SET', prefix .. 'rev:' .. key, rev)
end

for _, w in ipairs(req.writes) do
    if w.op == 'append' then
        local list = prefix .. 'seq:' .. w.key
        redis.call('RPUSH', list, cjson.encode(apply({}, w.fields)))
        bump(w.key)
    elseif w.op == 'delete' then
        redis.call('DEL', prefix .. 'doc:' .. w.key)
        redis.call('SREM', prefix .. 'idx:' .. w.collection, w.id)
        bump(w.key)
        bump(w.collection)
    else
        local doc = {}
        if w.op ~= 'set' then
            doc = load(w.key)
        end
        redis.call('SET', prefix .. 'doc:' .. w.key, cjson.encode(apply(doc, w.fields)))
        redis.call('SADD', prefix .. 'idx:' .. w.collection, w.id)
        bump(w.key)
        bump(w.collection)
    end
end

return {1, tostring(rev)}
"#;

/// Read one document and its revision together.
///
/// Arguments:
/// - ARGV[1]: Key prefix
/// - ARGV[2]: Document path
///
/// Returns:
/// - `{revision, body}` with `body` empty if the document is absent
pub const READ_DOC: &str = r#"
local prefix = ARGV[1]
local rev = redis.call('GET', prefix .. 'rev:' .. ARGV[2]) or '0'
local body = redis.call('GET', prefix .. 'doc:' .. ARGV[2]) or ''
return {rev, body}
"#;

/// Read every document of a collection with its revision.
///
/// Arguments:
/// - ARGV[1]: Key prefix
/// - ARGV[2]: Collection path
///
/// Returns:
/// - Flat list `{id, revision, body, id, revision, body, ...}`
pub const LIST_COLLECTION: &str = r#"
local prefix = ARGV[1]
local ids = redis.call('SMEMBERS', prefix .. 'idx:' .. ARGV[2])
local out = {}
for _, id in ipairs(ids) do
    local key = ARGV[2] .. '/' .. id
    local body = redis.call('GET', prefix .. 'doc:' .. key)
    if body then
        table.insert(out, id)
        table.insert(out, redis.call('GET', prefix .. 'rev:' .. key) or '0')
        table.insert(out, body)
    end
end
return out
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_checks_preconditions_before_writing() {
        let check = COMMIT.find("return {0, p.key}").unwrap_or(usize::MAX);
        let time = COMMIT.find("redis.call('TIME')").unwrap_or(0);
        assert!(check < time);
    }

    #[test]
    fn test_commit_reply_codes_match_client() {
        // Decoded by `commit_result` in client.rs.
        assert!(COMMIT.contains("return {1, tostring(rev)}"));
        assert!(COMMIT.contains("return {0, p.key}"));
        assert!(COMMIT.contains("return {-2, w.key}"));
    }
}
