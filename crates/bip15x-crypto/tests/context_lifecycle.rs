//! Process-wide context lifecycle. Runs in its own binary so shutting the
//! context down cannot race other tests.

use bip15x_crypto::{context, ChannelError, Connection, IdentityKeypair, Inbound, Message};

#[test]
fn test_shutdown_keeps_live_links() {
    assert!(!context::is_initialized());
    assert_eq!(
        Connection::new().unwrap_err(),
        ChannelError::ContextNotInitialized
    );

    assert!(context::init());
    let identity = IdentityKeypair::generate().unwrap();
    let mut a = Connection::new().unwrap();
    let mut b = Connection::new().unwrap();
    b.process_encinit(&a.outgoing_encinit()).unwrap();
    a.process_encack(&b.incoming_encack().unwrap(), true).unwrap();
    a.process_encinit(&b.outgoing_encinit()).unwrap();
    b.process_encack(&a.incoming_encack().unwrap(), true).unwrap();

    assert!(context::shutdown());
    assert!(!context::shutdown());
    assert!(!context::is_initialized());

    // Established links keep working: sealing, opening and ratcheting are
    // pure symmetric operations.
    let packet = a.seal_message(&Message::new("ping", Vec::new())).unwrap();
    assert!(matches!(b.open_message(&packet), Ok(Inbound::Message(_))));
    let signal = a.rekey_outgoing().unwrap();
    assert_eq!(b.open_message(&signal).unwrap(), Inbound::Rekeyed);

    // Anything that needs the curve context fails closed.
    assert_eq!(
        Connection::new().unwrap_err(),
        ChannelError::ContextNotInitialized
    );
    assert!(IdentityKeypair::generate().is_err());
    let sid = a
        .session_id(bip15x_crypto::SessionDirection::Outgoing)
        .unwrap();
    assert_eq!(
        bip15x_crypto::auth::reply(sid, &identity),
        Err(ChannelError::ContextNotInitialized)
    );

    assert!(context::init());
    assert!(Connection::new().is_ok());
}
