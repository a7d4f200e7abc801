use state_machines::state_machine;

state_machine! {
    name: ItemMachine,
    state: ItemState,
    initial: Discovered,
    states: [Discovered, Classified, Resolved, Relocated, Failed],
    events {
        classify { transition: { from: Discovered, to: Classified } }
        resolve { transition: { from: Classified, to: Resolved } }
        relocate { transition: { from: Resolved, to: Relocated } }
        abort {
            transition: { from: Discovered, to: Failed }
            transition: { from: Classified, to: Failed }
            transition: { from: Resolved, to: Failed }
        }
    }
}

pub fn discovered() -> ItemMachine<(), Discovered> {
    ItemMachine::new(())
}
