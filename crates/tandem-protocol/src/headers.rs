//! Request headers supplied by the upstream permission layer.

/// Edit permission header. `"True"` grants edit rights; anything else is read-only.
pub const CAN_EDIT: &str = "x-can-edit";

/// Authenticated user identity header.
pub const USER_ID: &str = "x-user-id";

/// Interpret the value of [`CAN_EDIT`].
///
/// The permission layer writes `"True"`; matching is case-insensitive and
/// ignores surrounding whitespace. A missing header means read-only.
#[must_use]
pub fn parse_can_edit(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}
