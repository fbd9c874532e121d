use rocket_rpc::rpc::context::{self, CallContext};

#[test]
fn scope_installs_and_clears_the_ambient_context() {
    assert_eq!(context::current_msg_id(), None);

    let seen = context::sync_scope(
        CallContext {
            msg_id: "abc".to_string(),
            method_name: "Order.makeOrder".to_string(),
        },
        || {
            (
                context::current_msg_id(),
                context::current_method_name(),
            )
        },
    );
    assert_eq!(seen.0.as_deref(), Some("abc"));
    assert_eq!(seen.1.as_deref(), Some("Order.makeOrder"));

    assert_eq!(context::current_msg_id(), None);
    assert_eq!(context::current_method_name(), None);
}

#[test]
fn empty_context_fields_count_as_absent() {
    let seen = context::sync_scope(CallContext::default(), context::current_msg_id);
    assert_eq!(seen, None);
}
