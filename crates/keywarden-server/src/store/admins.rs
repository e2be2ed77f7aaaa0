use anyhow::Result;
use redb::ReadableTable;

use super::db::{decode, encode, ADMINS};
use super::model::AdminAccount;

impl super::db::Store {
    /// Insert or overwrite an admin account.
    pub fn put_admin(&self, account: &AdminAccount) -> Result<()> {
        let bytes = encode(account)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ADMINS)?;
            table.insert(account.username.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up an admin account by username.
    pub fn get_admin(&self, username: &str) -> Result<Option<AdminAccount>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ADMINS)?;
        match table.get(username)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Find an admin account by email. Scans all records; the admin table
    /// holds a handful of rows at most.
    pub fn find_admin_by_email(&self, email: &str) -> Result<Option<AdminAccount>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ADMINS)?;
        for item in table.iter()? {
            let (_k, v) = item?;
            let account: AdminAccount = decode(v.value())?;
            if account.email == email {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    /// Check whether any admin account exists.
    pub fn has_admins(&self) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ADMINS)?;
        let has_any = table.iter()?.next().is_some();
        Ok(has_any)
    }
}
