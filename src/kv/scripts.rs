//! Server-side Lua scripts.
//!
//! The conditional decrement and the per-transaction status flip happen in a
//! single script call; that one-step contract is what the whole saga leans
//! on. Status codes written by the scripts must match
//! [`crate::models::TransactionStatus`]: 1 = FAILURE, 2 = SUCCESS.

use once_cell::sync::Lazy;
use redis::Script;

/// KEYS[1] = transaction status key, KEYS[2] = resource key,
/// ARGV[1] = amount. Returns the new value, or -1 on failure.
pub const LTE_DECREMENT: &str = r#"
local current = tonumber(redis.call('get', KEYS[2]))
if current == nil then
    redis.call('set', KEYS[1], 1)
    return -1
end
if tonumber(ARGV[1]) <= current then
    redis.call('set', KEYS[1], 2)
    return redis.call('decrby', KEYS[2], ARGV[1])
end
redis.call('set', KEYS[1], 1)
return -1
"#;

/// KEYS[1] = transaction status key, KEYS[2..] = resource keys,
/// ARGV[i-1] = amount for KEYS[i]. Validates every key first; either all
/// decrements apply or none do.
pub const M_GTE_DECREMENT: &str = r#"
local all_valid = true

for i, key in ipairs(KEYS) do
    if i > 1 then
        local current = tonumber(redis.call('get', key))
        if current == nil or tonumber(ARGV[i - 1]) > current then
            all_valid = false
            break
        end
    end
end

if all_valid then
    for i, key in ipairs(KEYS) do
        if i > 1 then
            redis.call('decrby', key, ARGV[i - 1])
        end
    end
    redis.call('set', KEYS[1], 2)
    return 1
else
    redis.call('set', KEYS[1], 1)
end

return -1
"#;

/// KEYS[1] = key, ARGV[1] = expected, ARGV[2] = new. Returns 1 iff swapped.
pub const COMPARE_AND_SET: &str = r#"
local current = redis.call('get', KEYS[1])
if current == ARGV[1] then
    redis.call('set', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

pub static LTE_DECREMENT_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(LTE_DECREMENT));
pub static M_GTE_DECREMENT_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(M_GTE_DECREMENT));
pub static COMPARE_AND_SET_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(COMPARE_AND_SET));
