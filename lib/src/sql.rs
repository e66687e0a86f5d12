use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::haar::Signature;
use crate::{IqdbId, PostId};

/// A row of the `images` table.
#[derive(Clone, Debug)]
pub struct ImageRecord {
    pub id: IqdbId,
    pub post_id: PostId,
    pub md5: String,
    pub signature: Signature,
}

/// The durable catalog: a single sqlite table mapping internal ids to
/// `(post_id, md5, signature)`. The in-memory index is a projection of this
/// table and is rebuilt from it at startup.
///
/// Access serializes on an internal mutex; readers-writer discipline across
/// the whole index lives above this layer.
pub(crate) struct SqlDb {
    connection: Mutex<sqlite::Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS 'images'
(
    'id' INTEGER PRIMARY KEY NOT NULL ,
    'post_id' INTEGER NOT NULL UNIQUE ,
    'md5' TEXT NOT NULL UNIQUE ,
    'avglf1' REAL NOT NULL , 'avglf2' REAL NOT NULL , 'avglf3' REAL NOT NULL ,
    'sig' BLOB NOT NULL
)";

impl SqlDb {
    /// Open (and if needed create) the catalog at `path`. `":memory:"`
    /// gives an ephemeral store.
    pub(crate) fn open(path: &str) -> Result<Self> {
        let connection = sqlite::open(path)?;
        connection.execute(SCHEMA)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub(crate) fn count(&self) -> Result<usize> {
        let connection = self.connection.lock();
        let statement = connection.prepare("SELECT COUNT(*) FROM images")?;
        for row in statement.into_iter() {
            let values: Vec<sqlite::Value> = row?.into();
            if let Some(sqlite::Value::Integer(count)) = values.first() {
                return Ok(*count as usize);
            }
        }
        Ok(0)
    }

    pub(crate) fn max_post_id(&self) -> Result<PostId> {
        let connection = self.connection.lock();
        let statement = connection.prepare("SELECT MAX(post_id) FROM images")?;
        for row in statement.into_iter() {
            let values: Vec<sqlite::Value> = row?.into();
            if let Some(sqlite::Value::Integer(max)) = values.first() {
                return Ok(*max as PostId);
            }
        }
        Ok(0)
    }

    pub(crate) fn get_by_post(&self, post_id: PostId) -> Result<Option<ImageRecord>> {
        let connection = self.connection.lock();
        let mut statement = connection.prepare("SELECT * FROM images WHERE post_id = ?")?;
        statement.bind((1, post_id as i64))?;
        let result = match statement.into_iter().next() {
            Some(Ok(row)) => parse_row(row.into()).map(Some),
            Some(Err(error)) => Err(error.into()),
            None => Ok(None),
        };
        result
    }

    pub(crate) fn get_by_md5(&self, md5: &str) -> Result<Option<ImageRecord>> {
        let connection = self.connection.lock();
        let mut statement = connection.prepare("SELECT * FROM images WHERE md5 = ?")?;
        statement.bind((1, md5))?;
        let result = match statement.into_iter().next() {
            Some(Ok(row)) => parse_row(row.into()).map(Some),
            Some(Err(error)) => Err(error.into()),
            None => Ok(None),
        };
        result
    }

    /// Insert a new image and return the internal id sqlite assigned to it.
    /// A uniqueness violation is reported as the conflict for whichever
    /// column collided; the statement is atomic, so nothing is written on
    /// failure.
    pub(crate) fn insert(&self, post_id: PostId, md5: &str, signature: &Signature) -> Result<IqdbId> {
        let connection = self.connection.lock();
        let query = "
        INSERT INTO images (post_id, md5, avglf1, avglf2, avglf3, sig)
        VALUES (:post_id, :md5, :avglf1, :avglf2, :avglf3, :sig)
        RETURNING id";
        let mut statement = connection.prepare(query)?;
        statement.bind::<&[(_, sqlite::Value)]>(
            &[
                (":post_id", (post_id as i64).into()),
                (":md5", md5.into()),
                (":avglf1", signature.avglf[0].into()),
                (":avglf2", signature.avglf[1].into()),
                (":avglf3", signature.avglf[2].into()),
                (":sig", signature.to_blob().into()),
            ][..],
        )?;
        let result = match statement.into_iter().next() {
            Some(Ok(row)) => {
                let values: Vec<sqlite::Value> = row.into();
                match values.first() {
                    Some(sqlite::Value::Integer(id)) => Ok(*id as IqdbId),
                    _ => Err(Error::BadRow),
                }
            }
            Some(Err(error)) => {
                if is_unique_violation(&error, "images.post_id") {
                    Err(Error::PostIdConflict(post_id))
                } else if is_unique_violation(&error, "images.md5") {
                    Err(Error::Md5Conflict(md5.to_string()))
                } else {
                    Err(error.into())
                }
            }
            None => Err(Error::Internal("insert returned no row".to_string())),
        };
        result
    }

    /// Delete by post id, returning how many rows went away.
    pub(crate) fn delete_by_post(&self, post_id: PostId) -> Result<usize> {
        let connection = self.connection.lock();
        let mut statement =
            connection.prepare("DELETE FROM images WHERE post_id = ? RETURNING id")?;
        statement.bind((1, post_id as i64))?;
        let mut removed = 0;
        for row in statement.into_iter() {
            row?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Streaming scan of the whole table, in unspecified order. Each row is
    /// handed to `visit` as parsed, or as the parse error for that row, so
    /// the caller decides whether a malformed record is fatal.
    pub(crate) fn for_each(&self, mut visit: impl FnMut(Result<ImageRecord>)) -> Result<()> {
        let connection = self.connection.lock();
        let statement = connection.prepare("SELECT * FROM images")?;
        for row in statement.into_iter() {
            visit(parse_row(row?.into()));
        }
        Ok(())
    }
}

fn parse_row(values: Vec<sqlite::Value>) -> Result<ImageRecord> {
    use sqlite::Value::{Binary, Float, Integer, String as Text};
    match values.as_slice() {
        [Integer(id), Integer(post_id), Text(md5), Float(avglf1), Float(avglf2), Float(avglf3), Binary(blob)] =>
        {
            let signature = Signature::from_parts([*avglf1, *avglf2, *avglf3], blob)?;
            Ok(ImageRecord {
                id: *id as IqdbId,
                post_id: *post_id as PostId,
                md5: md5.clone(),
                signature,
            })
        }
        _ => Err(Error::BadRow),
    }
}

fn is_unique_violation(error: &sqlite::Error, column: &str) -> bool {
    error
        .message
        .as_deref()
        .is_some_and(|message| {
            message.contains("UNIQUE constraint failed") && message.contains(column)
        })
}
