/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
  SetAdd { key: String, member: String },
  SetRemove { key: String, member: String },
  HashSet { key: String, fields: Vec<(String, String)> },
  HashDelete { key: String, fields: Vec<String> },
  Delete { key: String },
  Publish { channel: String, message: String },
}

/// Writes that are sent to the store as one atomic pipeline.
///
/// Operations are applied in insertion order, so a publish queued after a
/// hash write is only visible to subscribers once the write has landed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
  ops: Vec<WriteOp>,
}

impl WriteBatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
    self.ops.push(WriteOp::SetAdd {
      key: key.into(),
      member: member.into(),
    });
    self
  }

  pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
    self.ops.push(WriteOp::SetRemove {
      key: key.into(),
      member: member.into(),
    });
    self
  }

  pub fn hset(
    &mut self,
    key: impl Into<String>,
    field: impl Into<String>,
    value: impl Into<String>,
  ) -> &mut Self {
    self.hset_multiple(key, [(field.into(), value.into())])
  }

  pub fn hset_multiple<I>(&mut self, key: impl Into<String>, fields: I) -> &mut Self
  where
    I: IntoIterator<Item = (String, String)>,
  {
    let fields: Vec<_> = fields.into_iter().collect();
    if !fields.is_empty() {
      self.ops.push(WriteOp::HashSet {
        key: key.into(),
        fields,
      });
    }
    self
  }

  pub fn hdel<I, F>(&mut self, key: impl Into<String>, fields: I) -> &mut Self
  where
    I: IntoIterator<Item = F>,
    F: Into<String>,
  {
    let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
    if !fields.is_empty() {
      self.ops.push(WriteOp::HashDelete {
        key: key.into(),
        fields,
      });
    }
    self
  }

  pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
    self.ops.push(WriteOp::Delete { key: key.into() });
    self
  }

  pub fn publish(&mut self, channel: impl Into<String>, message: impl Into<String>) -> &mut Self {
    self.ops.push(WriteOp::Publish {
      channel: channel.into(),
      message: message.into(),
    });
    self
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  pub fn ops(&self) -> &[WriteOp] {
    &self.ops
  }

  pub fn into_ops(self) -> Vec<WriteOp> {
    self.ops
  }
}
