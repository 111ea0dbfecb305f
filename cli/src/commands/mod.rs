mod habit;
mod helpers;
mod progress;
mod sync;

pub(crate) use habit::{HabitArgs, cmd_habit_add, cmd_habit_delete, cmd_habit_edit, cmd_habit_list};
pub(crate) use helpers::print_banner;
pub(crate) use progress::{Step, cmd_history, cmd_step, cmd_today};
pub(crate) use sync::cmd_refresh;
