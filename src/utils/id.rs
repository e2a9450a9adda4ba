use uuid::Uuid;

/// Fresh identifier for a VM, in canonical hyphenated form.
pub fn new_vm_id() -> String {
    Uuid::new_v4().to_string()
}
