//! Validation and error-taxonomy tests that don't need a running `Client`.

use fleet_rpc::{
    options::{ClientOptions, DiscoveryMode},
    Error, ErrorKind,
};

fn base() -> ClientOptions {
    ClientOptions::builder()
        .discovery(DiscoveryMode::Direct {
            hosts: vec!["127.0.0.1:2020".parse().unwrap()],
        })
        .build()
}

#[test]
fn target_above_maximum_is_rejected() {
    let options = ClientOptions::builder()
        .discovery(DiscoveryMode::Direct {
            hosts: vec!["127.0.0.1:2020".parse().unwrap()],
        })
        .target(10)
        .maximum(5)
        .build();

    let err = options.validate().unwrap_err();
    assert!(matches!(&*err.kind, ErrorKind::InitialConnect { .. }));
}

#[test]
fn zero_target_is_rejected() {
    let options = ClientOptions::builder()
        .discovery(DiscoveryMode::Direct {
            hosts: vec!["127.0.0.1:2020".parse().unwrap()],
        })
        .target(0)
        .build();

    assert!(options.validate().is_err());
}

#[test]
fn defaults_pass_validation() {
    assert!(base().validate().is_ok());
}

#[test]
fn unwrap_to_root_cause_is_a_no_op_on_an_unwrapped_error() {
    let err = Error::from(ErrorKind::Transport {
        message: "boom".to_string(),
        address: "127.0.0.1:1".parse().unwrap(),
    });

    let unwrapped = err.unwrap_to_root_cause();
    assert!(matches!(&*unwrapped.kind, ErrorKind::Transport { .. }));
}

#[test]
fn no_backends_is_identified_through_is_no_backends() {
    let err = Error::from(ErrorKind::NoBackends);
    assert!(err.is_no_backends());

    let other = Error::from(ErrorKind::ClientClosed);
    assert!(!other.is_no_backends());
}
