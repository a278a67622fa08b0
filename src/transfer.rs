//! Moving owned resources alongside message data
//!
//! A message on a channel is an [Envelope]: plain JSON data plus a list of
//! owned resources. The data refers to each resource by its slot index with
//! a `{"resource": n}` placeholder. Types that own resources implement
//! [Transferable] to move them out into the list when sending, and to take
//! them back out of the slots when receiving.

use crate::{
    errors::IPCError,
    protocol::{Call, Failure, ResourceSlot, SpawnReply, VPid},
    stream::{ByteReader, ByteWriter, EntryStream},
};
use serde_json::{Map, Value};
use std::fmt;

/// An owned object that can be moved to the other side of a channel
pub enum Resource {
    Reader(ByteReader),
    Writer(ByteWriter),
    Entries(EntryStream),
}

impl Resource {
    fn kind(&self) -> &'static str {
        match self {
            Resource::Reader(_) => "reader",
            Resource::Writer(_) => "writer",
            Resource::Entries(_) => "entry stream",
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Resource({})", self.kind())
    }
}

/// One message: data plus the resources it refers to
#[derive(Debug, Default)]
pub struct Envelope {
    pub data: Value,
    pub resources: Vec<Resource>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Envelope {
            data,
            resources: Vec::new(),
        }
    }

    /// Move a transferable value into a fresh envelope
    pub fn pack<T: Transferable>(value: T) -> Self {
        let mut resources = Vec::new();
        let data = value.extract(&mut resources);
        Envelope { data, resources }
    }

    /// Rebuild a transferable value, consuming the envelope
    pub fn unpack<T: Transferable>(self) -> Result<T, IPCError> {
        let mut resources = Resources::new(self.resources);
        T::restore(self.data, &mut resources)
    }
}

/// Received resource slots, each of which can be taken once
#[derive(Debug, Default)]
pub struct Resources {
    slots: Vec<Option<Resource>>,
}

impl Resources {
    pub fn new(resources: Vec<Resource>) -> Self {
        Resources {
            slots: resources.into_iter().map(Some).collect(),
        }
    }

    pub fn take(&mut self, index: usize) -> Result<Resource, IPCError> {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(IPCError::UnknownResource(index))
    }

    /// Take the resource a `{"resource": n}` placeholder refers to
    pub fn take_slot(&mut self, data: Value) -> Result<Resource, IPCError> {
        let slot: ResourceSlot = serde_json::from_value(data)?;
        self.take(slot.resource)
    }
}

/// A value that may own resources and can cross a channel
pub trait Transferable: Sized + Send + 'static {
    /// Move owned resources into `resources`, returning data that refers to them
    fn extract(self, resources: &mut Vec<Resource>) -> Value;

    /// Rebuild a value from data and the resources it refers to
    fn restore(data: Value, resources: &mut Resources) -> Result<Self, IPCError>;
}

fn placeholder(resources: &mut Vec<Resource>, resource: Resource) -> Value {
    let slot = ResourceSlot {
        resource: resources.len(),
    };
    resources.push(resource);
    serde_json::json!(slot)
}

fn slot_index(value: &Value) -> Option<usize> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("resource")?.as_u64().map(|n| n as usize),
        _ => None,
    }
}

/// Rewrite every placeholder in `value` through `remap`
fn remap_slots<F>(value: &mut Value, remap: &mut F) -> Result<(), IPCError>
where
    F: FnMut(usize) -> Result<usize, IPCError>,
{
    if let Some(index) = slot_index(value) {
        let mut map = Map::new();
        map.insert("resource".to_string(), Value::from(remap(index)?));
        *value = Value::Object(map);
        return Ok(());
    }
    match value {
        Value::Array(items) => {
            for item in items {
                remap_slots(item, remap)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                remap_slots(item, remap)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl Transferable for Envelope {
    fn extract(self, resources: &mut Vec<Resource>) -> Value {
        let Envelope {
            mut data,
            resources: mut own,
        } = self;
        let base = resources.len();
        // indexes are ours, so this can't fail
        let _ = remap_slots(&mut data, &mut |index| Ok(base + index));
        resources.append(&mut own);
        data
    }

    fn restore(mut data: Value, resources: &mut Resources) -> Result<Self, IPCError> {
        let mut own = Vec::new();
        remap_slots(&mut data, &mut |index| {
            own.push(resources.take(index)?);
            Ok(own.len() - 1)
        })?;
        Ok(Envelope {
            data,
            resources: own,
        })
    }
}

impl Transferable for ByteReader {
    fn extract(self, resources: &mut Vec<Resource>) -> Value {
        placeholder(resources, Resource::Reader(self))
    }

    fn restore(data: Value, resources: &mut Resources) -> Result<Self, IPCError> {
        let index = slot_index(&data);
        match resources.take_slot(data)? {
            Resource::Reader(reader) => Ok(reader),
            other => Err(IPCError::ResourceType(
                index.unwrap_or_default(),
                other.kind(),
                "reader",
            )),
        }
    }
}

impl Transferable for ByteWriter {
    fn extract(self, resources: &mut Vec<Resource>) -> Value {
        placeholder(resources, Resource::Writer(self))
    }

    fn restore(data: Value, resources: &mut Resources) -> Result<Self, IPCError> {
        let index = slot_index(&data);
        match resources.take_slot(data)? {
            Resource::Writer(writer) => Ok(writer),
            other => Err(IPCError::ResourceType(
                index.unwrap_or_default(),
                other.kind(),
                "writer",
            )),
        }
    }
}

impl Transferable for EntryStream {
    fn extract(self, resources: &mut Vec<Resource>) -> Value {
        placeholder(resources, Resource::Entries(self))
    }

    fn restore(data: Value, resources: &mut Resources) -> Result<Self, IPCError> {
        let index = slot_index(&data);
        match resources.take_slot(data)? {
            Resource::Entries(entries) => Ok(entries),
            other => Err(IPCError::ResourceType(
                index.unwrap_or_default(),
                other.kind(),
                "entry stream",
            )),
        }
    }
}

/// Implement [Transferable] for types that are only plain data
macro_rules! plain_data {
    ($($t:ty),*) => {$(
        impl Transferable for $t {
            fn extract(self, _resources: &mut Vec<Resource>) -> Value {
                serde_json::to_value(self).unwrap_or(Value::Null)
            }

            fn restore(data: Value, _resources: &mut Resources) -> Result<Self, IPCError> {
                Ok(serde_json::from_value(data)?)
            }
        }
    )*};
}

plain_data!(Value, Call, Failure, bool, i32, String, ());

/// A freshly spawned process, seen from whoever spawned it
///
/// Holds the other ends of the child's stdio: a writer feeding its input
/// and readers draining its output.
#[derive(Debug)]
pub struct Spawned {
    pub pid: VPid,
    pub stdin: ByteWriter,
    pub stdout: ByteReader,
    pub stderr: ByteReader,
}

impl Transferable for Spawned {
    fn extract(self, resources: &mut Vec<Resource>) -> Value {
        let reply = SpawnReply {
            pid: self.pid,
            stdin: ResourceSlot {
                resource: resources.len(),
            },
            stdout: ResourceSlot {
                resource: resources.len() + 1,
            },
            stderr: ResourceSlot {
                resource: resources.len() + 2,
            },
        };
        resources.push(Resource::Writer(self.stdin));
        resources.push(Resource::Reader(self.stdout));
        resources.push(Resource::Reader(self.stderr));
        serde_json::to_value(reply).unwrap_or(Value::Null)
    }

    fn restore(data: Value, resources: &mut Resources) -> Result<Self, IPCError> {
        let reply: SpawnReply = serde_json::from_value(data)?;
        let slot = |slot: ResourceSlot| serde_json::json!(slot);
        Ok(Spawned {
            pid: reply.pid,
            stdin: ByteWriter::restore(slot(reply.stdin), resources)?,
            stdout: ByteReader::restore(slot(reply.stdout), resources)?,
            stderr: ByteReader::restore(slot(reply.stderr), resources)?,
        })
    }
}
