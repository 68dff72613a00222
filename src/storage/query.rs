//! Query matching for the in-memory adapter.
//!
//! Supported conditions per key: plain equality (array fields match when they
//! contain the value), `$ne`, `$in`, `$nin`, `$exists`; top level `$or`/`$and`.
//! Keys may be dotted (`authData.facebook.id`). Pointers compare by class and id.

use serde_json::Value;

use super::Object;

pub fn matches(obj: &Object, query: &Object) -> bool {
    query.iter().all(|(key, cond)| match key.as_str() {
        "$or" => sub_queries(cond).any(|q| matches(obj, q)),
        "$and" => sub_queries(cond).all(|q| matches(obj, q)),
        _ => match_condition(lookup(obj, key), cond),
    })
}

fn sub_queries(cond: &Value) -> impl Iterator<Item = &Object> {
    cond.as_array().into_iter().flatten().filter_map(|v| v.as_object())
}

pub fn lookup<'a>(obj: &'a Object, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut cur = obj.get(parts.next()?)?;
    for p in parts {
        cur = cur.as_object()?.get(p)?;
    }
    Some(cur)
}

fn operator_object(cond: &Value) -> Option<&Object> {
    let map = cond.as_object()?;
    if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) { Some(map) } else { None }
}

fn match_condition(field: Option<&Value>, cond: &Value) -> bool {
    let Some(ops) = operator_object(cond) else { return equals(field, cond); };
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$ne" => !equals(field, arg),
        "$in" => arg.as_array().map(|vals| vals.iter().any(|v| equals(field, v))).unwrap_or(false),
        "$nin" => arg.as_array().map(|vals| !vals.iter().any(|v| equals(field, v))).unwrap_or(true),
        "$exists" => {
            let present = field.map(|v| !v.is_null()).unwrap_or(false);
            arg.as_bool().unwrap_or(false) == present
        }
        _ => false,
    })
}

fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|i| same(i, expected)),
        Some(v) => same(v, expected),
    }
}

fn same(a: &Value, b: &Value) -> bool {
    match (pointer_key(a), pointer_key(b)) {
        (Some(pa), Some(pb)) => pa == pb,
        _ => a == b,
    }
}

fn pointer_key(v: &Value) -> Option<(&str, &str)> {
    let m = v.as_object()?;
    if m.get("__type").and_then(|t| t.as_str()) != Some("Pointer") { return None; }
    Some((m.get("className")?.as_str()?, m.get("objectId")?.as_str()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Object { v.as_object().cloned().unwrap() }

    #[test]
    fn equality_and_ne() {
        let o = obj(json!({"objectId": "a1", "username": "u1"}));
        assert!(matches(&o, &obj(json!({"username": "u1"}))));
        assert!(!matches(&o, &obj(json!({"username": "u2"}))));
        assert!(matches(&o, &obj(json!({"username": "u1", "objectId": {"$ne": "zz"}}))));
        assert!(!matches(&o, &obj(json!({"username": "u1", "objectId": {"$ne": "a1"}}))));
        // absent field is "not equal"
        assert!(matches(&o, &obj(json!({"email": {"$ne": "x@y"}}))));
    }

    #[test]
    fn dotted_keys_and_or() {
        let o = obj(json!({"authData": {"facebook": {"id": "fb1"}}}));
        let q = obj(json!({"$or": [{"authData.twitter.id": "t1"}, {"authData.facebook.id": "fb1"}]}));
        assert!(matches(&o, &q));
        let q = obj(json!({"$or": [{"authData.twitter.id": "t1"}]}));
        assert!(!matches(&o, &q));
    }

    #[test]
    fn array_containment_and_in() {
        let o = obj(json!({"users": ["u1", "u2"], "deviceType": "ios"}));
        assert!(matches(&o, &obj(json!({"users": "u2"}))));
        assert!(!matches(&o, &obj(json!({"users": "u3"}))));
        assert!(matches(&o, &obj(json!({"deviceType": {"$in": ["android", "ios"]}}))));
        assert!(matches(&o, &obj(json!({"deviceType": {"$nin": ["android"]}}))));
        assert!(matches(&o, &obj(json!({"badge": {"$exists": false}}))));
    }

    #[test]
    fn pointers_compare_by_identity() {
        let o = obj(json!({"user": {"__type": "Pointer", "className": "_User", "objectId": "u1"}}));
        let q = obj(json!({"user": {"objectId": "u1", "className": "_User", "__type": "Pointer"}}));
        assert!(matches(&o, &q));
        let q = obj(json!({"user": {"__type": "Pointer", "className": "_User", "objectId": "u2"}}));
        assert!(!matches(&o, &q));
    }
}
