use uuid::Uuid;

/// Generate a unique consumer name for a group
///
/// The name is `{group}_{random}`; every process start gets a new identity,
/// which is why idle consumers have to be reaped.
///
/// # Example
///
/// ```
/// use redstream::consumer::generate_consumer_name;
///
/// let name = generate_consumer_name("billing");
/// assert!(name.starts_with("billing_"));
/// ```
pub fn generate_consumer_name(group: &str) -> String {
    format!("{}_{}", group, Uuid::new_v4().simple())
}
