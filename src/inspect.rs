//! Structured inspection and property enumeration over runtime values.

use std::collections::HashSet;
use std::sync::Arc;

use crate::protocol::InspectionReport;
use crate::value::{Value, ValueKind, ValueRef};

/// Inspects a single value: canonical string, type name, constructor chain
/// and (where meaningful) length.
pub fn inspect(value: &ValueRef) -> InspectionReport {
    let kind = value.kind();
    match kind {
        ValueKind::Undefined | ValueKind::Null => InspectionReport {
            string: value.display(),
            type_name: kind.type_name().to_string(),
            ..InspectionReport::default()
        },
        ValueKind::Bool | ValueKind::Number => InspectionReport {
            string: value.display(),
            type_name: kind.type_name().to_string(),
            constructor_list: Some(wrapper_chain(kind.type_name())),
            ..InspectionReport::default()
        },
        ValueKind::Str | ValueKind::Function => InspectionReport {
            string: value.display(),
            type_name: kind.type_name().to_string(),
            constructor_list: Some(wrapper_chain(kind.type_name())),
            length: value.length(),
        },
        ValueKind::Object => {
            let constructors = constructor_list(value);
            InspectionReport {
                string: value.value_of().unwrap_or_else(|| value.display()),
                type_name: constructors.first().cloned().unwrap_or_default(),
                constructor_list: Some(constructors),
                length: value.length(),
            }
        }
    }
}

fn wrapper_chain(wrapper: &str) -> Vec<String> {
    vec![wrapper.to_string(), "Object".to_string()]
}

/// Constructor names read along the prototype chain. Stops on a prototype
/// without a readable constructor, on a null prototype, or on a revisit.
pub fn constructor_list(value: &ValueRef) -> Vec<String> {
    let mut list = Vec::new();
    let mut visited: Vec<*const ()> = Vec::new();
    let mut prototype = value.prototype();
    while let Some(node) = prototype {
        let key = Arc::as_ptr(&node) as *const ();
        if visited.contains(&key) {
            break;
        }
        visited.push(key);
        match node.constructor_name() {
            Some(name) => list.push(name),
            None => break,
        }
        prototype = node.prototype();
    }
    list
}

/// Enumerates every property name reachable along the prototype chain.
///
/// Own names are sorted per prototype and appended first-wins. Primitives
/// start at their wrapper prototype; `undefined`/`null` have none.
pub fn all_property_names(value: &ValueRef) -> Vec<String> {
    let kind = value.kind();
    if matches!(kind, ValueKind::Undefined | ValueKind::Null) {
        return Vec::new();
    }

    let mut current = if kind.is_primitive() {
        value.prototype()
    } else {
        Some(value.clone())
    };

    let mut names = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut visited: Vec<*const ()> = Vec::new();
    while let Some(node) = current {
        let key = Arc::as_ptr(&node) as *const ();
        if visited.contains(&key) {
            break;
        }
        visited.push(key);

        let mut own = node.own_property_names();
        own.sort();
        for name in own {
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
        current = node.prototype();
    }
    names
}
