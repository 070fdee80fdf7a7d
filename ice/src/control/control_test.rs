use super::*;

#[test]
fn test_role_opposite() {
    assert_eq!(Role::Controlling.opposite(), Role::Controlled);
    assert_eq!(Role::Controlled.opposite(), Role::Controlling);
    assert_eq!(Role::Unspecified.opposite(), Role::Unspecified);
}

#[test]
fn test_role_from_str() {
    assert_eq!(Role::from("controlling"), Role::Controlling);
    assert_eq!(Role::from("controlled"), Role::Controlled);
    assert_eq!(Role::from("bogus"), Role::Unspecified);
}

#[test]
fn test_role_display() {
    assert_eq!(Role::Controlling.to_string(), "controlling");
    assert_eq!(Role::Controlled.to_string(), "controlled");
    assert_eq!(Role::Unspecified.to_string(), "unspecified");
}

#[test]
fn test_attr_controlling_round_trip() {
    let mut m = Message::new();
    AttrControlling(424_242).add_to(&mut m).unwrap();

    let mut decoded = AttrControlling::default();
    decoded.get_from(&m).unwrap();
    assert_eq!(decoded.0, 424_242);

    // ICE-CONTROLLED must not be readable off an ICE-CONTROLLING-only message.
    let mut controlled = AttrControlled::default();
    assert!(controlled.get_from(&m).is_err());
}

#[test]
fn test_attr_controlled_round_trip() {
    let mut m = Message::new();
    AttrControlled(7).add_to(&mut m).unwrap();

    let mut decoded = AttrControlled::default();
    decoded.get_from(&m).unwrap();
    assert_eq!(decoded.0, 7);
}

#[test]
fn test_attr_control_adds_controlling_attribute_for_controlling_role() {
    let mut m = Message::new();
    let attr = AttrControl {
        role: Role::Controlling,
        tie_breaker: TieBreaker(99),
    };
    attr.add_to(&mut m).unwrap();

    assert!(m.contains(stun::attributes::ATTR_ICE_CONTROLLING));
    assert!(!m.contains(stun::attributes::ATTR_ICE_CONTROLLED));
}

#[test]
fn test_attr_control_adds_controlled_attribute_for_controlled_role() {
    let mut m = Message::new();
    let attr = AttrControl {
        role: Role::Controlled,
        tie_breaker: TieBreaker(99),
    };
    attr.add_to(&mut m).unwrap();

    assert!(m.contains(stun::attributes::ATTR_ICE_CONTROLLED));
    assert!(!m.contains(stun::attributes::ATTR_ICE_CONTROLLING));
}

#[test]
fn test_attr_control_get_from_detects_role_and_tie_breaker() {
    let mut m = Message::new();
    AttrControlling(55).add_to(&mut m).unwrap();

    let mut decoded = AttrControl::default();
    decoded.get_from(&m).unwrap();
    assert_eq!(decoded.role, Role::Controlling);
    assert_eq!(decoded.tie_breaker, TieBreaker(55));
}

#[test]
fn test_attr_control_get_from_missing_both_attributes_errors() {
    let m = Message::new();
    let mut decoded = AttrControl::default();
    assert!(decoded.get_from(&m).is_err());
}
