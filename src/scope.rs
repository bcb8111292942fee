//! Who can see what.
//!
//! A task in a list belongs to the list's members. A task outside any
//! list (or whose list has been deleted) belongs to its owner alone.

use uuid::Uuid;

use crate::models::{List, ListRole, Recipe, StagingItem, Task};
use crate::world::{Event, World};

pub fn can_see_task(world: &World, user_id: Uuid, task: &Task) -> bool {
    match task.list_id.and_then(|id| world.lists.get(&id)) {
        Some(list) => list.role_of(user_id).is_some(),
        None => task.owner_id == user_id,
    }
}

pub fn can_see_list(list: &List, user_id: Uuid) -> bool {
    list.role_of(user_id).is_some()
}

pub fn can_manage_list(list: &List, user_id: Uuid) -> bool {
    list.role_of(user_id) == Some(ListRole::Owner)
}

pub fn can_see_recipe(recipe: &Recipe, user_id: Uuid) -> bool {
    recipe.owner_id == user_id
}

pub fn can_see_staging(item: &StagingItem, user_id: Uuid) -> bool {
    item.owner_id == user_id
}

/// Whether a broadcast event should reach this user.
///
/// Checked against the world after the event was committed. A task moved
/// out of a list still reaches that list's members so they can drop it,
/// and list deletions carry the member list they had.
pub fn can_see_event(world: &World, user_id: Uuid, event: &Event) -> bool {
    match event {
        Event::TaskUpdated { task, previous_list_id, .. } => {
            can_see_task(world, user_id, task)
                || previous_list_id
                    .and_then(|id| world.lists.get(&id))
                    .is_some_and(|list| can_see_list(list, user_id))
        }
        Event::TaskCreated { task, .. }
        | Event::TaskDeleted { task, .. }
        | Event::TaskCompleted { task, .. } => can_see_task(world, user_id, task),
        Event::TasksCreated { tasks, .. } | Event::TasksWoken { tasks, .. } => {
            tasks.iter().any(|t| can_see_task(world, user_id, t))
        }
        Event::ListCreated { list, .. }
        | Event::ListUpdated { list, .. }
        | Event::ListDeleted { list, .. } => can_see_list(list, user_id),
        Event::RecipeCreated { recipe, .. } | Event::RecipeDeleted { recipe, .. } => {
            can_see_recipe(recipe, user_id)
        }
        Event::StagingCreated { item, .. }
        | Event::StagingUpdated { item, .. }
        | Event::StagingDeleted { item, .. }
        | Event::CandidateResolved { item, .. } => can_see_staging(item, user_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use crate::world::Command;
    use chrono::Utc;

    #[test]
    fn private_task_only_visible_to_owner() {
        let mut w = World::new();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let task = match w.apply(Command::AddTask(NewTask::new("Secret")), owner, Utc::now()).unwrap() {
            Event::TaskCreated { task, .. } => task,
            _ => panic!("expected TaskCreated"),
        };

        assert!(can_see_task(&w, owner, &task));
        assert!(!can_see_task(&w, stranger, &task));
    }

    #[test]
    fn listed_task_follows_list_membership() {
        let mut w = World::new();
        let owner = Uuid::new_v4();
        let friend = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let list = match w.apply(
            Command::CreateList { name: "Groceries".into(), color: "green".into(), icon: None },
            owner,
            Utc::now(),
        ).unwrap() {
            Event::ListCreated { list, .. } => list,
            _ => panic!("expected ListCreated"),
        };
        w.apply(Command::JoinList { shared_id: list.shared_id }, friend, Utc::now()).unwrap();

        let mut input = NewTask::new("Milk");
        input.list_id = Some(list.id);
        let task = match w.apply(Command::AddTask(input), friend, Utc::now()).unwrap() {
            Event::TaskCreated { task, .. } => task,
            _ => panic!("expected TaskCreated"),
        };

        // Created by the editor, still visible to the list owner.
        assert!(can_see_task(&w, owner, &task));
        assert!(can_see_task(&w, friend, &task));
        assert!(!can_see_task(&w, stranger, &task));
    }

    #[test]
    fn moving_task_out_of_shared_list_reaches_old_members() {
        let mut w = World::new();
        let owner = Uuid::new_v4();
        let friend = Uuid::new_v4();

        let create = |w: &mut World, name: &str| match w.apply(
            Command::CreateList { name: name.into(), color: "slate".into(), icon: None },
            owner,
            Utc::now(),
        ).unwrap() {
            Event::ListCreated { list, .. } => list,
            _ => panic!("expected ListCreated"),
        };
        let shared = create(&mut w, "Household");
        let private = create(&mut w, "Mine");
        w.apply(Command::JoinList { shared_id: shared.shared_id }, friend, Utc::now()).unwrap();

        let mut input = NewTask::new("Birthday gift");
        input.list_id = Some(shared.id);
        let task = match w.apply(Command::AddTask(input), owner, Utc::now()).unwrap() {
            Event::TaskCreated { task, .. } => task,
            _ => panic!("expected TaskCreated"),
        };

        let patch = crate::models::TaskPatch { list_id: Some(private.id), ..Default::default() };
        let moved = w.apply(Command::UpdateTask { task_id: task.id, patch }, owner, Utc::now()).unwrap();
        assert!(matches!(moved, Event::TaskUpdated { previous_list_id: Some(id), .. } if id == shared.id));

        assert!(!can_see_task(&w, friend, &w.tasks[&task.id]));
        assert!(can_see_event(&w, friend, &moved));
        assert!(can_see_event(&w, owner, &moved));
        assert!(!can_see_event(&w, Uuid::new_v4(), &moved));
    }

    #[test]
    fn orphaned_task_falls_back_to_owner() {
        let mut w = World::new();
        let owner = Uuid::new_v4();
        let friend = Uuid::new_v4();

        let list = match w.apply(
            Command::CreateList { name: "Trip".into(), color: "sky".into(), icon: None },
            owner,
            Utc::now(),
        ).unwrap() {
            Event::ListCreated { list, .. } => list,
            _ => panic!("expected ListCreated"),
        };
        w.apply(Command::JoinList { shared_id: list.shared_id }, friend, Utc::now()).unwrap();

        let mut input = NewTask::new("Book hostel");
        input.list_id = Some(list.id);
        let task = match w.apply(Command::AddTask(input), owner, Utc::now()).unwrap() {
            Event::TaskCreated { task, .. } => task,
            _ => panic!("expected TaskCreated"),
        };

        w.apply(Command::DeleteList { list_id: list.id }, owner, Utc::now()).unwrap();

        let task = &w.tasks[&task.id];
        assert_eq!(task.list_id, Some(list.id));
        assert!(can_see_task(&w, owner, task));
        assert!(!can_see_task(&w, friend, task));
    }
}
