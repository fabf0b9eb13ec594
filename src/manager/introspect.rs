//! The introspection surface: a structured description of the control
//! interface, plus a serializer that renders the standard introspection
//! document.
//!
//! Transport is out of scope; a D-Bus (or any other) adaptor consumes
//! these descriptions to publish itself.

/// The data type of an argument or property, with its wire signature.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArgType {
    /// Boolean.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit unsigned integer.
    UInt32,
    /// Double-precision float.
    Double,
    /// UTF-8 string.
    String,
    /// String-keyed variant map.
    Dict,
}

impl ArgType {
    /// The single-character (or container) signature code.
    pub fn signature(&self) -> &'static str {
        match self {
            ArgType::Bool => "b",
            ArgType::Int32 => "i",
            ArgType::Int64 => "x",
            ArgType::UInt32 => "u",
            ArgType::Double => "d",
            ArgType::String => "s",
            ArgType::Dict => "a{sv}",
        }
    }
}

/// Argument direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Caller to callee.
    In,
    /// Callee to caller.
    Out,
}

/// A named, typed argument.
#[derive(Debug, Clone)]
pub struct Arg {
    /// Argument name.
    pub name: &'static str,
    /// Argument type.
    pub ty: ArgType,
    /// Argument direction. Ignored for signals, which only ever emit.
    pub direction: Direction,
}

/// A callable method.
#[derive(Debug, Clone)]
pub struct Method {
    /// Method name.
    pub name: &'static str,
    /// Arguments, in declaration order.
    pub args: Vec<Arg>,
}

/// An emitted signal.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Signal name.
    pub name: &'static str,
    /// Arguments, in declaration order.
    pub args: Vec<Arg>,
}

/// Property access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// Readable only.
    Read,
    /// Readable and writable.
    ReadWrite,
}

/// An observable property.
#[derive(Debug, Clone)]
pub struct Property {
    /// Property name.
    pub name: &'static str,
    /// Property type.
    pub ty: ArgType,
    /// Property access.
    pub access: Access,
}

/// A complete control interface.
#[derive(Debug, Clone)]
pub struct Interface {
    /// Fully-qualified interface name.
    pub name: &'static str,
    /// Methods, in declaration order.
    pub methods: Vec<Method>,
    /// Signals, in declaration order.
    pub signals: Vec<Signal>,
    /// Properties, in declaration order.
    pub properties: Vec<Property>,
}

fn arg(name: &'static str, ty: ArgType, direction: Direction) -> Arg {
    Arg {
        name,
        ty,
        direction,
    }
}

/// The player control interface: the commands a control surface can
/// deliver and the state it can observe.
pub fn player_interface() -> Interface {
    use ArgType::*;
    use Direction::*;

    Interface {
        name: "org.adagio.Player",
        methods: vec![
            Method { name: "Play", args: vec![] },
            Method { name: "Pause", args: vec![] },
            Method { name: "Stop", args: vec![] },
            Method { name: "Next", args: vec![] },
            Method { name: "Previous", args: vec![] },
            Method {
                name: "Seek",
                args: vec![arg("offset", Int64, In)],
            },
            Method {
                name: "Volume",
                args: vec![arg("step", Int32, In)],
            },
            Method { name: "Mute", args: vec![] },
            Method { name: "Quit", args: vec![] },
        ],
        signals: vec![
            Signal {
                name: "PlaybackStatusChanged",
                args: vec![arg("status", String, Out)],
            },
            Signal {
                name: "LoopStatusChanged",
                args: vec![arg("status", String, Out)],
            },
            Signal {
                name: "MetadataChanged",
                args: vec![arg("metadata", Dict, Out)],
            },
            Signal {
                name: "VolumeChanged",
                args: vec![arg("volume", Double, Out)],
            },
        ],
        properties: vec![
            Property { name: "PlaybackStatus", ty: String, access: Access::Read },
            Property { name: "LoopStatus", ty: String, access: Access::ReadWrite },
            Property { name: "Shuffle", ty: Bool, access: Access::ReadWrite },
            Property { name: "Metadata", ty: Dict, access: Access::Read },
            Property { name: "Volume", ty: Double, access: Access::ReadWrite },
            Property { name: "Position", ty: Int64, access: Access::Read },
            Property { name: "CanGoNext", ty: Bool, access: Access::Read },
            Property { name: "CanPlay", ty: Bool, access: Access::Read },
            Property { name: "CanPause", ty: Bool, access: Access::Read },
            Property { name: "CanSeek", ty: Bool, access: Access::Read },
            Property { name: "CanControl", ty: Bool, access: Access::Read },
        ],
    }
}

/// Renders interfaces as a standard introspection document.
pub fn render_xml(node: &str, interfaces: &[Interface]) -> String {
    let mut xml = String::new();
    xml.push_str(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
    );
    xml.push_str(&format!("<node name=\"{node}\">\n"));

    for iface in interfaces {
        xml.push_str(&format!("  <interface name=\"{}\">\n", iface.name));

        for method in &iface.methods {
            if method.args.is_empty() {
                xml.push_str(&format!("    <method name=\"{}\"/>\n", method.name));
                continue;
            }

            xml.push_str(&format!("    <method name=\"{}\">\n", method.name));
            for a in &method.args {
                let dir = match a.direction {
                    Direction::In => "in",
                    Direction::Out => "out",
                };
                xml.push_str(&format!(
                    "      <arg name=\"{}\" type=\"{}\" direction=\"{dir}\"/>\n",
                    a.name,
                    a.ty.signature()
                ));
            }
            xml.push_str("    </method>\n");
        }

        for signal in &iface.signals {
            xml.push_str(&format!("    <signal name=\"{}\">\n", signal.name));
            for a in &signal.args {
                xml.push_str(&format!(
                    "      <arg name=\"{}\" type=\"{}\"/>\n",
                    a.name,
                    a.ty.signature()
                ));
            }
            xml.push_str("    </signal>\n");
        }

        for prop in &iface.properties {
            let access = match prop.access {
                Access::Read => "read",
                Access::ReadWrite => "readwrite",
            };
            xml.push_str(&format!(
                "    <property name=\"{}\" type=\"{}\" access=\"{access}\"/>\n",
                prop.name,
                prop.ty.signature()
            ));
        }

        xml.push_str("  </interface>\n");
    }

    xml.push_str("</node>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_interface_covers_the_command_surface() {
        let iface = player_interface();
        let methods: Vec<&str> = iface.methods.iter().map(|m| m.name).collect();
        for required in [
            "Play", "Pause", "Stop", "Next", "Previous", "Seek", "Volume", "Mute", "Quit",
        ] {
            assert!(methods.contains(&required), "missing method {required}");
        }

        let props: Vec<&str> = iface.properties.iter().map(|p| p.name).collect();
        for required in ["CanGoNext", "CanPlay", "CanPause", "CanSeek", "CanControl"] {
            assert!(props.contains(&required), "missing property {required}");
        }
    }

    #[test]
    fn renders_well_formed_introspection_xml() {
        let xml = render_xml("/org/adagio/Player", &[player_interface()]);

        assert!(xml.starts_with("<!DOCTYPE node"));
        assert!(xml.contains("<interface name=\"org.adagio.Player\">"));
        assert!(xml.contains("<method name=\"Play\"/>"));
        assert!(xml.contains("<arg name=\"step\" type=\"i\" direction=\"in\"/>"));
        assert!(xml.contains("<property name=\"Volume\" type=\"d\" access=\"readwrite\"/>"));
        assert!(xml.ends_with("</node>\n"));

        // Tags balance.
        assert_eq!(xml.matches("<interface").count(), xml.matches("</interface>").count());
        assert_eq!(
            xml.matches("<method name").count(),
            player_interface().methods.len()
        );
    }
}
