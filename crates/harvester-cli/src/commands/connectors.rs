use harvester_types::connection::ConnectionKind;

use super::registry;

/// Execute the `connectors` command: list connector kinds by connection kind.
pub fn execute() {
    let registry = registry();
    for kind in [
        ConnectionKind::Repository,
        ConnectionKind::Transformation,
        ConnectionKind::Output,
    ] {
        let kinds = registry.kinds(kind);
        println!("{kind}:");
        if kinds.is_empty() {
            println!("  (none)");
        }
        for connector in kinds {
            println!("  {connector}");
        }
    }
}
