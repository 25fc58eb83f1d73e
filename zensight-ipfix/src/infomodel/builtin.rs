//! Built-in element definitions.

use super::{DataType, IANA_PEN, InfoElement, Semantics, Units};

/// CERT enterprise number, owner of the template-metadata elements.
pub const CERT_PEN: u32 = 6871;

/// Compact row: name, id, type, semantics, units, reversible.
type Row = (&'static str, u16, DataType, Semantics, Units, bool);

use DataType as T;
use Semantics as S;
use Units as U;

const IANA: &[Row] = &[
    ("octetDeltaCount", 1, T::Unsigned64, S::DeltaCounter, U::Octets, true),
    ("packetDeltaCount", 2, T::Unsigned64, S::DeltaCounter, U::Packets, true),
    ("deltaFlowCount", 3, T::Unsigned64, S::DeltaCounter, U::Flows, true),
    ("protocolIdentifier", 4, T::Unsigned8, S::Identifier, U::None, false),
    ("ipClassOfService", 5, T::Unsigned8, S::Identifier, U::None, true),
    ("tcpControlBits", 6, T::Unsigned16, S::Flags, U::None, true),
    ("sourceTransportPort", 7, T::Unsigned16, S::Identifier, U::None, false),
    ("sourceIPv4Address", 8, T::Ipv4Address, S::Default, U::None, false),
    ("sourceIPv4PrefixLength", 9, T::Unsigned8, S::Default, U::Bits, false),
    ("ingressInterface", 10, T::Unsigned32, S::Identifier, U::None, true),
    ("destinationTransportPort", 11, T::Unsigned16, S::Identifier, U::None, false),
    ("destinationIPv4Address", 12, T::Ipv4Address, S::Default, U::None, false),
    ("destinationIPv4PrefixLength", 13, T::Unsigned8, S::Default, U::Bits, false),
    ("egressInterface", 14, T::Unsigned32, S::Identifier, U::None, true),
    ("ipNextHopIPv4Address", 15, T::Ipv4Address, S::Default, U::None, true),
    ("bgpSourceAsNumber", 16, T::Unsigned32, S::Identifier, U::None, false),
    ("bgpDestinationAsNumber", 17, T::Unsigned32, S::Identifier, U::None, false),
    ("bgpNextHopIPv4Address", 18, T::Ipv4Address, S::Default, U::None, true),
    ("flowEndSysUpTime", 21, T::Unsigned32, S::Default, U::Milliseconds, true),
    ("flowStartSysUpTime", 22, T::Unsigned32, S::Default, U::Milliseconds, true),
    ("sourceIPv6Address", 27, T::Ipv6Address, S::Default, U::None, false),
    ("destinationIPv6Address", 28, T::Ipv6Address, S::Default, U::None, false),
    ("flowLabelIPv6", 31, T::Unsigned32, S::Identifier, U::None, true),
    ("icmpTypeCodeIPv4", 32, T::Unsigned16, S::Identifier, U::None, true),
    ("minimumTTL", 52, T::Unsigned8, S::Default, U::Hops, true),
    ("maximumTTL", 53, T::Unsigned8, S::Default, U::Hops, true),
    ("sourceMacAddress", 56, T::MacAddress, S::Default, U::None, false),
    ("vlanId", 58, T::Unsigned16, S::Identifier, U::None, true),
    ("ipVersion", 60, T::Unsigned8, S::Identifier, U::None, false),
    ("flowDirection", 61, T::Unsigned8, S::Identifier, U::None, true),
    ("ipNextHopIPv6Address", 62, T::Ipv6Address, S::Default, U::None, true),
    ("destinationMacAddress", 80, T::MacAddress, S::Default, U::None, false),
    ("interfaceName", 82, T::String, S::Default, U::None, false),
    ("interfaceDescription", 83, T::String, S::Default, U::None, false),
    ("octetTotalCount", 85, T::Unsigned64, S::TotalCounter, U::Octets, true),
    ("packetTotalCount", 86, T::Unsigned64, S::TotalCounter, U::Packets, true),
    ("forwardingStatus", 89, T::Unsigned32, S::Identifier, U::None, false),
    ("applicationDescription", 94, T::String, S::Default, U::None, false),
    ("applicationName", 96, T::String, S::Default, U::None, false),
    ("exporterIPv4Address", 130, T::Ipv4Address, S::Default, U::None, false),
    ("exporterIPv6Address", 131, T::Ipv6Address, S::Default, U::None, false),
    ("flowEndReason", 136, T::Unsigned8, S::Identifier, U::None, true),
    ("observationPointId", 138, T::Unsigned64, S::Identifier, U::None, false),
    ("exportingProcessId", 144, T::Unsigned32, S::Identifier, U::None, false),
    ("templateId", 145, T::Unsigned16, S::Identifier, U::None, false),
    ("flowId", 148, T::Unsigned64, S::Identifier, U::None, false),
    ("observationDomainId", 149, T::Unsigned32, S::Identifier, U::None, false),
    ("flowStartSeconds", 150, T::DateTimeSeconds, S::Default, U::Seconds, true),
    ("flowEndSeconds", 151, T::DateTimeSeconds, S::Default, U::Seconds, true),
    ("flowStartMilliseconds", 152, T::DateTimeMilliseconds, S::Default, U::Milliseconds, true),
    ("flowEndMilliseconds", 153, T::DateTimeMilliseconds, S::Default, U::Milliseconds, true),
    ("flowStartMicroseconds", 154, T::DateTimeMicroseconds, S::Default, U::Microseconds, true),
    ("flowEndMicroseconds", 155, T::DateTimeMicroseconds, S::Default, U::Microseconds, true),
    ("flowStartNanoseconds", 156, T::DateTimeNanoseconds, S::Default, U::Nanoseconds, true),
    ("flowEndNanoseconds", 157, T::DateTimeNanoseconds, S::Default, U::Nanoseconds, true),
    ("flowDurationMilliseconds", 161, T::Unsigned32, S::Default, U::Milliseconds, true),
    ("ignoredPacketTotalCount", 164, T::Unsigned64, S::TotalCounter, U::Packets, false),
    ("notSentFlowTotalCount", 166, T::Unsigned64, S::TotalCounter, U::Flows, false),
    ("icmpTypeIPv4", 176, T::Unsigned8, S::Identifier, U::None, true),
    ("icmpCodeIPv4", 177, T::Unsigned8, S::Identifier, U::None, true),
    ("paddingOctets", 210, T::OctetArray, S::Default, U::None, false),
    ("biflowDirection", 239, T::Unsigned8, S::Identifier, U::None, false),
    ("dataRecordsReliability", 276, T::Boolean, S::Identifier, U::None, false),
    ("basicList", 291, T::BasicList, S::List, U::None, false),
    ("subTemplateList", 292, T::SubTemplateList, S::List, U::None, false),
    ("subTemplateMultiList", 293, T::SubTemplateMultiList, S::List, U::None, false),
    ("informationElementId", 303, T::Unsigned16, S::Identifier, U::None, false),
    ("samplingProbability", 311, T::Float64, S::Quantity, U::None, false),
    ("absoluteError", 320, T::Float64, S::Quantity, U::Inferred, false),
    ("informationElementDataType", 339, T::Unsigned8, S::Identifier, U::None, false),
    ("informationElementDescription", 340, T::String, S::Default, U::None, false),
    ("informationElementName", 341, T::String, S::Default, U::None, false),
    ("informationElementRangeBegin", 342, T::Unsigned64, S::Quantity, U::None, false),
    ("informationElementRangeEnd", 343, T::Unsigned64, S::Quantity, U::None, false),
    ("informationElementSemantics", 344, T::Unsigned8, S::Identifier, U::None, false),
    ("informationElementUnits", 345, T::Unsigned16, S::Identifier, U::None, false),
    ("privateEnterpriseNumber", 346, T::Unsigned32, S::Identifier, U::None, false),
    ("mibObjectValueInteger", 434, T::Signed32, S::Quantity, U::None, false),
];

const CERT: &[Row] = &[
    ("templateName", 1000, T::String, S::Default, U::None, false),
    ("templateDescription", 1001, T::String, S::Default, U::None, false),
    ("parentTemplateId", 1002, T::Unsigned16, S::Identifier, U::None, false),
    ("templateInformationElementList", 1003, T::SubTemplateList, S::List, U::None, false),
];

fn expand(pen: u32, rows: &[Row]) -> impl Iterator<Item = InfoElement> + '_ {
    rows.iter()
        .map(move |&(name, id, data_type, semantics, units, reversible)| {
            let ie = InfoElement::new(name, pen, id, data_type)
                .with_semantics(semantics)
                .with_units(units);
            if reversible { ie.reversible() } else { ie }
        })
}

/// Built-in IANA elements followed by the CERT metadata elements.
pub fn builtin_elements() -> Vec<InfoElement> {
    expand(IANA_PEN, IANA).chain(expand(CERT_PEN, CERT)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_idents_unique() {
        let elements = builtin_elements();
        let idents: HashSet<_> = elements.iter().map(|ie| ie.ident()).collect();
        let names: HashSet<_> = elements.iter().map(|ie| ie.name.as_str()).collect();

        assert_eq!(idents.len(), elements.len());
        assert_eq!(names.len(), elements.len());
    }

    #[test]
    fn test_builtin_lengths() {
        for ie in builtin_elements() {
            assert!(
                ie.data_type.accepts_len(ie.len),
                "{} has invalid default length {}",
                ie.name,
                ie.len
            );
        }
    }
}
