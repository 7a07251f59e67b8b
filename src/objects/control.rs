//! Message-only objects.

use crate::analysis::{Domain, Precision};
use crate::channel::ChannelRole;
use crate::error::PatchError;
use crate::object::{ObjectContext, ObjectRegistry, ObjectSpec, PatchObject, PortKind, PortSpec};
use crate::routing::MessageMeta;
use crate::value::Value;

use super::{number, text};

pub(crate) fn register(registry: &mut ObjectRegistry) {
    registry.register(&ADD, || Box::<Add>::default());
    registry.register(&TRIGGER, || Box::<Trigger>::default());
    registry.register(&SEND, || Box::new(MessageChannel::new(ChannelRole::Send)));
    registry.register(&RECEIVE, || Box::new(MessageChannel::new(ChannelRole::Receive)));
    registry.register(&SPECTRUM, || Box::<Spectrum>::default());
}

static ADD: ObjectSpec = ObjectSpec {
    type_name: "+",
    group: None,
    inlets: &[
        PortSpec::new("left", PortKind::Message).hot(),
        PortSpec::new("right", PortKind::Float),
    ],
    outlets: &[PortSpec::new("sum", PortKind::Float)],
};

/// `+ [addend]`: the left inlet stores and outputs, the right only stores.
#[derive(Default)]
pub struct Add {
    left: f64,
    addend: f64,
}

impl PatchObject for Add {
    fn create(&mut self, _cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        self.addend = number(params, 0).unwrap_or(0.0);
        Ok(())
    }

    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, meta: &MessageMeta) {
        if meta.inlet == 1 {
            if let Some(n) = data.as_f64() {
                self.addend = n;
            }
            return;
        }
        if !data.is_bang() {
            let Some(n) = data.as_f64() else {
                tracing::debug!(node = cx.node_id(), ?data, "not a number");
                return;
            };
            self.left = n;
        }
        if meta.hot {
            cx.send(Value::Float(self.left + self.addend));
        }
    }
}

static TRIGGER: ObjectSpec = ObjectSpec {
    type_name: "trigger",
    group: None,
    inlets: &[PortSpec::new("in", PortKind::Message).hot()],
    outlets: &[PortSpec::new("out", PortKind::Message)],
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Conversion {
    Bang,
    Float,
    Symbol,
    Anything,
    List,
}

impl Conversion {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "b" | "bang" => Some(Conversion::Bang),
            "f" | "float" => Some(Conversion::Float),
            "s" | "symbol" => Some(Conversion::Symbol),
            "a" | "anything" => Some(Conversion::Anything),
            "l" | "list" => Some(Conversion::List),
            _ => None,
        }
    }

    fn apply(self, data: &Value) -> Option<Value> {
        match self {
            Conversion::Bang => Some(Value::Bang),
            Conversion::Float => data.as_f64().map(Value::Float),
            Conversion::Symbol => match data {
                Value::Str(s) => Some(Value::Str(s.clone())),
                Value::Int(i) => Some(Value::Str(i.to_string())),
                Value::Float(f) => Some(Value::Str(f.to_string())),
                Value::Bang => Some(Value::from("bang")),
                _ => None,
            },
            Conversion::Anything => Some(data.clone()),
            Conversion::List => match data {
                Value::List(_) => Some(data.clone()),
                other => Some(Value::List(vec![other.clone()])),
            },
        }
    }
}

/// `trigger <types…>`: one outlet per type, fired right to left.
#[derive(Default)]
pub struct Trigger {
    outlets: Vec<Conversion>,
}

impl PatchObject for Trigger {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        self.outlets = params
            .iter()
            .map(|param| {
                param
                    .as_str()
                    .and_then(Conversion::parse)
                    .ok_or_else(|| PatchError::create(cx.node_id(), format!("unknown conversion {param:?}")))
            })
            .collect::<Result<_, _>>()?;
        if self.outlets.is_empty() {
            self.outlets = vec![Conversion::Anything; 2];
        }
        Ok(())
    }

    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, _meta: &MessageMeta) {
        for (outlet, conversion) in self.outlets.iter().enumerate().rev() {
            match conversion.apply(&data) {
                Some(value) => cx.send_to(outlet, value),
                None => tracing::debug!(node = cx.node_id(), outlet, ?conversion, "conversion failed"),
            }
        }
    }
}

static SEND: ObjectSpec = ObjectSpec {
    type_name: "send",
    group: None,
    inlets: &[PortSpec::new("in", PortKind::Message).hot()],
    outlets: &[],
};

static RECEIVE: ObjectSpec = ObjectSpec {
    type_name: "receive",
    group: None,
    inlets: &[],
    outlets: &[PortSpec::new("out", PortKind::Message)],
};

/// `send <channel>` and `receive <channel>`
pub struct MessageChannel {
    role: ChannelRole,
    channel: String,
}

impl MessageChannel {
    fn new(role: ChannelRole) -> Self {
        Self {
            role,
            channel: String::new(),
        }
    }
}

impl PatchObject for MessageChannel {
    fn create(&mut self, cx: &mut ObjectContext<'_>, params: &[Value]) -> Result<(), PatchError> {
        let channel = text(params, 0).ok_or_else(|| PatchError::create(cx.node_id(), "missing channel name"))?;
        self.channel = channel.to_owned();
        cx.subscribe(channel, self.role);
        Ok(())
    }

    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, _meta: &MessageMeta) {
        match self.role {
            ChannelRole::Send => cx.send_channel(&self.channel, data),
            ChannelRole::Receive => cx.send(data),
        }
    }

    fn destroy(&mut self, cx: &mut ObjectContext<'_>) {
        if !self.channel.is_empty() {
            cx.unsubscribe(&self.channel);
        }
    }
}

static SPECTRUM: ObjectSpec = ObjectSpec {
    type_name: "spectrum",
    group: None,
    inlets: &[PortSpec::new("analysis", PortKind::Analysis).hot()],
    outlets: &[PortSpec::new("peak", PortKind::Float)],
};

/// `spectrum`: reads float spectra from the analyser wired into it and
/// outputs the frequency of the loudest bin.
#[derive(Default)]
pub struct Spectrum {
    sample_rate: f64,
}

impl PatchObject for Spectrum {
    fn create(&mut self, cx: &mut ObjectContext<'_>, _params: &[Value]) -> Result<(), PatchError> {
        self.sample_rate = f64::from(cx.host().sample_rate());
        cx.request_analysis(Domain::Freq, Precision::Float);
        Ok(())
    }

    fn on_message(&mut self, cx: &mut ObjectContext<'_>, data: Value, _meta: &MessageMeta) {
        let Value::Floats(bins) = data else {
            return;
        };
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(index, _)| index);
        if let Some(index) = peak {
            let hz = index as f64 * self.sample_rate / (2 * bins.len()) as f64;
            cx.send(Value::Float(hz));
        }
    }

    fn destroy(&mut self, cx: &mut ObjectContext<'_>) {
        cx.disable_analysis();
    }
}
